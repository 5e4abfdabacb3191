//! 会话键模型
//!
//! 会话键标识身份缓存中的一个槽位：同一个段（segment）、同一个事务、
//! 同一个有效用户的所有请求共享同一个身份对象。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 会话键
///
/// 三个字段全部参与相等性比较与哈希。段 ID 没有取值限制，
/// 负数或哨兵值同样有效。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// 段 ID
    pub segment_id: i32,
    /// 事务 ID（不透明字符串）
    pub transaction_id: String,
    /// 有效用户名
    pub effective_user: String,
}

impl SessionKey {
    /// 创建新的会话键
    pub fn new(segment_id: i32, transaction_id: &str, effective_user: &str) -> Self {
        Self {
            segment_id,
            transaction_id: transaction_id.to_string(),
            effective_user: effective_user.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session[segment={}, transaction={}, user={}]",
            self.segment_id, self.transaction_id, self.effective_user
        )
    }
}
