//! 身份解析策略
//!
//! 根据服务器的安全模式、用户模拟设置和服务用户配置，
//! 决定每个请求应当以哪个用户身份执行。

use fedgate_common::{Error, RequestDescriptor, Result};
use tracing::debug;

use super::secure_login::SecureLogin;
use crate::identity::IdentityHandle;
use crate::utils::{expand_principal, realm_of};

/// 解析结果
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// 服务器的登录身份
    pub login: IdentityHandle,
    /// 有效用户名（会话键的一部分）
    pub user: String,
    /// 是否以代理身份模拟请求用户
    pub impersonate: bool,
    /// 服务器是否启用 Kerberos
    pub kerberos: bool,
}

/// 身份解析策略
pub struct IdentityResolutionPolicy {
    login: SecureLogin,
    /// 安全模式下模拟用户时是否为用户名追加 realm
    expand_user_principal: bool,
}

impl IdentityResolutionPolicy {
    /// 创建新的解析策略
    pub fn new(login: SecureLogin, expand_user_principal: bool) -> Self {
        Self {
            login,
            expand_user_principal,
        }
    }

    /// 解析请求的有效身份
    pub fn resolve(&self, request: &RequestDescriptor) -> Result<ResolvedIdentity> {
        let security = &request.security;
        let secure = security.kerberos_enabled;
        let impersonate = request.impersonation_enabled();
        validate_constrained_delegation(request, secure, impersonate)?;

        let login = self.login.login_user(request)?;

        // 安全模式且未启用模拟时，可用配置的服务用户替代 Kerberos 主体
        let service_user = match security.service_user_name() {
            Some(name) if secure && !impersonate => name,
            _ => login.user_name(),
        };

        let mut user = if impersonate {
            request.user.clone()
        } else {
            service_user.to_string()
        };

        if secure && impersonate && (self.expand_user_principal || security.constrained_delegation) {
            if let Some(realm) = realm_of(login.user_name()) {
                let expanded = expand_principal(&user, realm);
                if expanded != user {
                    debug!("用户主体名称由 {} 扩展为 {}", user, expanded);
                    user = expanded;
                }
            }
        }

        debug!(
            "请求用户 {} 以 [有效用户={}，服务用户={}，登录用户={}] 执行，{}用户模拟",
            request.user,
            user,
            service_user,
            login.user_name(),
            if impersonate { "启用" } else { "未启用" }
        );

        Ok(ResolvedIdentity {
            login: login.clone(),
            user,
            impersonate,
            kerberos: secure,
        })
    }
}

/// 约束委派要求同时启用安全模式和用户模拟
fn validate_constrained_delegation(request: &RequestDescriptor, secure: bool, impersonate: bool) -> Result<()> {
    if !request.security.constrained_delegation {
        return Ok(());
    }
    if !secure {
        return Err(Error::Config(format!(
            "服务器 {} 未启用 Kerberos，不应启用约束委派（配置目录 {}）",
            request.server_name, request.config_dir
        )));
    }
    if !impersonate {
        return Err(Error::Config(format!(
            "服务器 {} 启用了约束委派，但未启用用户模拟（配置目录 {}）",
            request.server_name, request.config_dir
        )));
    }
    debug!("服务器 {} 已启用约束委派与用户模拟", request.server_name);
    Ok(())
}
