//! 请求描述符模型
//!
//! 请求描述符由（本仓库之外的）请求解析层构造，携带段 ID、事务 ID、
//! 发起请求的数据库用户以及目标服务器的安全配置。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// 未指定服务器时使用的服务器名称
pub const DEFAULT_SERVER_NAME: &str = "default";

/// 两次 Kerberos 重新登录之间的默认最小间隔（秒）
pub const DEFAULT_MIN_RELOGIN_SECONDS: u64 = 60;

/// 服务器安全配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSecurityConfig {
    /// 是否启用 Kerberos 安全模式
    pub kerberos_enabled: bool,
    /// Kerberos 服务主体
    pub principal: Option<String>,
    /// Kerberos keytab 文件路径
    pub keytab: Option<PathBuf>,
    /// 服务器级别的用户模拟默认值
    pub user_impersonation: bool,
    /// 服务用户名（安全模式且未启用模拟时替代登录身份）
    pub service_user: Option<String>,
    /// 是否启用 Kerberos 约束委派
    pub constrained_delegation: bool,
    /// 两次重新登录之间的最小间隔（秒）
    pub min_relogin_seconds: u64,
}

impl Default for ServerSecurityConfig {
    fn default() -> Self {
        Self {
            kerberos_enabled: false,
            principal: None,
            keytab: None,
            user_impersonation: false,
            service_user: None,
            constrained_delegation: false,
            min_relogin_seconds: DEFAULT_MIN_RELOGIN_SECONDS,
        }
    }
}

impl ServerSecurityConfig {
    /// 配置的服务用户名，空白值视为未配置
    pub fn service_user_name(&self) -> Option<&str> {
        non_blank(self.service_user.as_deref())
    }

    /// 配置的服务主体，空白值视为未配置
    pub fn principal_name(&self) -> Option<&str> {
        non_blank(self.principal.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// 请求描述符
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// 段 ID
    pub segment_id: i32,
    /// 事务 ID
    pub transaction_id: String,
    /// 发起请求的用户
    pub user: String,
    /// 服务器名称
    pub server_name: String,
    /// 服务器配置目录
    pub config_dir: String,
    /// 单个请求对用户模拟的覆盖设置
    pub impersonation: Option<bool>,
    /// 是否为该段的最后一个分片
    pub last_fragment: bool,
    /// 服务器安全配置
    pub security: ServerSecurityConfig,
}

impl RequestDescriptor {
    /// 创建新的请求描述符，目标为默认服务器
    pub fn new(
        segment_id: i32,
        transaction_id: &str,
        user: &str,
        security: ServerSecurityConfig,
    ) -> Result<Self> {
        if transaction_id.trim().is_empty() {
            return Err(Error::InvalidRequest("事务 ID 不能为空".to_string()));
        }
        if user.trim().is_empty() {
            return Err(Error::InvalidRequest("用户名不能为空".to_string()));
        }

        Ok(Self {
            segment_id,
            transaction_id: transaction_id.to_string(),
            user: user.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            config_dir: DEFAULT_SERVER_NAME.to_string(),
            impersonation: None,
            last_fragment: false,
            security,
        })
    }

    /// 指定目标服务器；配置目录为空时默认与服务器同名
    pub fn with_server(mut self, server_name: &str, config_dir: Option<&str>) -> Self {
        let server_name = match server_name.trim() {
            "" => DEFAULT_SERVER_NAME,
            name => name,
        };
        self.server_name = server_name.to_string();
        self.config_dir = non_blank(config_dir).unwrap_or(server_name).to_string();
        self
    }

    /// 设置单个请求的用户模拟覆盖值
    pub fn with_impersonation(mut self, impersonation: Option<bool>) -> Self {
        self.impersonation = impersonation;
        self
    }

    /// 标记为该段的最后一个分片
    pub fn with_last_fragment(mut self, last_fragment: bool) -> Self {
        self.last_fragment = last_fragment;
        self
    }

    /// 本次请求是否启用用户模拟（请求覆盖值优先于服务器配置）
    pub fn impersonation_enabled(&self) -> bool {
        self.impersonation.unwrap_or(self.security.user_impersonation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_default_server() {
        let request = RequestDescriptor::new(0, "txn-id", "gpadmin", ServerSecurityConfig::default()).unwrap();
        assert_eq!(request.server_name, "default");
        assert_eq!(request.config_dir, "default");
        assert!(!request.last_fragment);
    }

    #[test]
    fn test_config_dir_falls_back_to_server_name() {
        let request = RequestDescriptor::new(0, "txn-id", "gpadmin", ServerSecurityConfig::default())
            .unwrap()
            .with_server("hdfs-prod", Some("  "));
        assert_eq!(request.config_dir, "hdfs-prod");

        let request = request.with_server("", Some("/etc/fedgate/servers/hdfs"));
        assert_eq!(request.server_name, "default");
        assert_eq!(request.config_dir, "/etc/fedgate/servers/hdfs");
    }

    #[test]
    fn test_blank_user_or_transaction_is_rejected() {
        assert!(matches!(
            RequestDescriptor::new(0, " ", "gpadmin", ServerSecurityConfig::default()),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            RequestDescriptor::new(0, "txn-id", "", ServerSecurityConfig::default()),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_override_wins_over_server_default() {
        let security = ServerSecurityConfig {
            user_impersonation: true,
            ..ServerSecurityConfig::default()
        };
        let request = RequestDescriptor::new(0, "txn-id", "alice", security).unwrap();
        assert!(request.impersonation_enabled());
        assert!(!request.clone().with_impersonation(Some(false)).impersonation_enabled());
    }

    #[test]
    fn test_security_config_deserializes_with_defaults() {
        let config: ServerSecurityConfig = serde_json::from_str(
            r#"{"kerberos_enabled": true, "principal": "gpadmin/_HOST@EXAMPLE.COM", "service_user": "  "}"#,
        )
        .unwrap();
        assert!(config.kerberos_enabled);
        assert_eq!(config.principal_name(), Some("gpadmin/_HOST@EXAMPLE.COM"));
        assert_eq!(config.service_user_name(), None);
        assert_eq!(config.min_relogin_seconds, DEFAULT_MIN_RELOGIN_SECONDS);
        assert!(config.keytab.is_none());
    }
}
