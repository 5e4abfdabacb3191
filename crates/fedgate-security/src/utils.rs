//! 安全模块工具函数
//!
//! 该模块封装了 Kerberos 主体名称处理等常用的辅助函数。

use std::time::Duration;

/// 提取 Kerberos 主体中的 realm（`user/host@REALM` 中的 `REALM`）
pub fn realm_of(principal: &str) -> Option<&str> {
    principal
        .rsplit_once('@')
        .map(|(_, realm)| realm)
        .filter(|realm| !realm.is_empty())
}

/// 为用户名追加 realm，已以该 realm 结尾时保持不变
pub fn expand_principal(user: &str, realm: &str) -> String {
    if user.ends_with(realm) {
        user.to_string()
    } else {
        format!("{}@{}", user, realm)
    }
}

/// 格式化持续时间为人类可读的字符串
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();

    if seconds < 60 {
        return format!("{} 秒", seconds);
    }

    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{} 分钟 {} 秒", minutes, seconds % 60);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} 小时 {} 分钟", hours, minutes % 60);
    }

    let days = hours / 24;
    format!("{} 天 {} 小时", days, hours % 24)
}
