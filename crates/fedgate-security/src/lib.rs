//! FedGate 安全核心
//!
//! 该模块实现数据联邦网关的会话身份管理：为每个（段、事务、用户）组合
//! 创建并缓存身份，在并发请求之间共享，并在不再使用后按 TTL 或段结束信号销毁。
//! 身份解析策略决定每个请求以哪个用户身份执行。

pub mod identity;
pub mod policy;
pub mod service;
pub mod utils;

pub use identity::{CacheStats, IdentityCache};
pub use policy::{IdentityResolutionPolicy, LoginDefaults, SecureLogin};
pub use service::SecurityService;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use identity::{Clock, IdentityProvider, LoginProvider};

/// 安全服务构建参数
pub struct SecurityOptions {
    /// 未被引用身份的有效期
    pub identity_ttl: Duration,
    /// 安全模式下模拟用户时是否追加 realm
    pub expand_user_principal: bool,
    /// 默认服务器的网关级凭据
    pub login_defaults: LoginDefaults,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            identity_ttl: identity::DEFAULT_IDENTITY_TTL,
            expand_user_principal: true,
            login_defaults: LoginDefaults::default(),
        }
    }
}

/// 安全服务初始化函数
pub fn init(
    identity_provider: Arc<dyn IdentityProvider>,
    login_provider: Arc<dyn LoginProvider>,
    clock: Arc<dyn Clock>,
    options: SecurityOptions,
) -> SecurityService {
    info!(
        "初始化 FedGate 安全服务，身份有效期: {}，realm 扩展: {}",
        utils::format_duration(options.identity_ttl),
        options.expand_user_principal
    );

    let cache = Arc::new(IdentityCache::new(identity_provider, clock.clone(), options.identity_ttl));
    let login = SecureLogin::new(login_provider, clock, options.login_defaults);
    let policy = IdentityResolutionPolicy::new(login, options.expand_user_principal);

    SecurityService::new(policy, cache)
}
