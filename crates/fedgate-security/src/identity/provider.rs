//! 身份提供方模块
//!
//! 该模块定义身份缓存与外部身份系统之间的边界：身份对象本身、
//! 创建/销毁请求身份的 [`IdentityProvider`]，以及负责服务登录的
//! [`LoginProvider`]。Kerberos 与 Hadoop 的具体交互由实现方负责，
//! 对核心逻辑完全不透明。

use fedgate_common::{Error, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// 以某个操作系统/Kerberos 主体身份运行的能力
pub trait Identity: Send + Sync + fmt::Debug {
    /// 身份对应的用户名（Kerberos 身份包含 realm）
    fn user_name(&self) -> &str;

    /// 以该身份执行动作
    ///
    /// 实现方可以返回 [`Error::Interrupted`] 表示执行被中断。
    fn run_as(&self, action: &mut dyn FnMut() -> anyhow::Result<()>) -> anyhow::Result<()>;
}

/// 共享的身份句柄
pub type IdentityHandle = Arc<dyn Identity>;

/// 请求身份的创建与销毁
#[cfg_attr(test, mockall::automock)]
pub trait IdentityProvider: Send + Sync {
    /// 创建远程用户身份（不模拟）
    fn create_remote_identity(
        &self,
        user: &str,
        login: &IdentityHandle,
        kerberos_enabled: bool,
    ) -> Result<IdentityHandle>;

    /// 以登录身份为基础创建模拟（代理）身份
    fn create_proxy_identity(&self, user: &str, login: &IdentityHandle) -> Result<IdentityHandle>;

    /// 销毁身份，释放其持有的凭据资源
    fn destroy(&self, identity: &IdentityHandle) -> Result<()>;
}

/// 服务登录身份的建立与续期
#[cfg_attr(test, mockall::automock)]
pub trait LoginProvider: Send + Sync {
    /// 使用 keytab 进行 Kerberos 登录
    fn login_from_keytab(&self, server: &str, principal: &str, keytab: &Path) -> Result<IdentityHandle>;

    /// 以普通用户身份登录（非安全模式）
    fn login_user(&self, user: &str) -> Result<IdentityHandle>;

    /// 使用 keytab 重新登录，刷新即将过期的票据
    fn relogin_from_keytab(&self, login: &IdentityHandle) -> Result<()>;
}

/// 进程内身份，直接在当前线程执行动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    user_name: String,
    real_user: Option<String>,
}

impl LocalIdentity {
    /// 创建普通身份
    pub fn new(user_name: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            real_user: None,
        }
    }

    /// 创建以 `real_user` 为真实用户的代理身份
    pub fn proxy(user_name: &str, real_user: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            real_user: Some(real_user.to_string()),
        }
    }

    /// 代理身份的真实用户
    pub fn real_user(&self) -> Option<&str> {
        self.real_user.as_deref()
    }
}

impl Identity for LocalIdentity {
    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn run_as(&self, action: &mut dyn FnMut() -> anyhow::Result<()>) -> anyhow::Result<()> {
        action()
    }
}

/// 非安全部署使用的本地身份提供方
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalIdentityProvider;

impl IdentityProvider for LocalIdentityProvider {
    fn create_remote_identity(
        &self,
        user: &str,
        _login: &IdentityHandle,
        kerberos_enabled: bool,
    ) -> Result<IdentityHandle> {
        if kerberos_enabled {
            return Err(Error::Identity(format!("本地身份提供方无法为 {} 创建 Kerberos 身份", user)));
        }
        Ok(Arc::new(LocalIdentity::new(user)))
    }

    fn create_proxy_identity(&self, user: &str, login: &IdentityHandle) -> Result<IdentityHandle> {
        Ok(Arc::new(LocalIdentity::proxy(user, login.user_name())))
    }

    fn destroy(&self, identity: &IdentityHandle) -> Result<()> {
        debug!("销毁本地身份: {}", identity.user_name());
        Ok(())
    }
}

impl LoginProvider for LocalIdentityProvider {
    fn login_from_keytab(&self, server: &str, principal: &str, _keytab: &Path) -> Result<IdentityHandle> {
        Err(Error::Authentication(format!(
            "本地身份提供方不支持 Kerberos 登录（服务器 {}，主体 {}）",
            server, principal
        )))
    }

    fn login_user(&self, user: &str) -> Result<IdentityHandle> {
        Ok(Arc::new(LocalIdentity::new(user)))
    }

    fn relogin_from_keytab(&self, _login: &IdentityHandle) -> Result<()> {
        Ok(())
    }
}
