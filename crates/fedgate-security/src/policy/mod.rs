//! 身份策略模块
//!
//! 该模块负责决定每个请求使用的身份：按服务器缓存网关的登录身份，
//! 并根据安全模式、用户模拟和服务用户配置解析请求的有效用户。

mod resolution;
mod secure_login;

pub use resolution::{IdentityResolutionPolicy, ResolvedIdentity};
pub use secure_login::{LoginDefaults, SecureLogin};

use std::sync::Arc;

use crate::identity::{Clock, LoginProvider};

/// 创建默认的身份解析策略（启用 realm 扩展，无网关级默认凭据）
pub fn create_default_policy(provider: Arc<dyn LoginProvider>, clock: Arc<dyn Clock>) -> IdentityResolutionPolicy {
    IdentityResolutionPolicy::new(SecureLogin::new(provider, clock, LoginDefaults::default()), true)
}
