//! 身份管理模块
//!
//! 该模块负责请求身份的创建、缓存与销毁。
//! 包含时钟抽象、身份提供方接口和会话身份缓存实现。

mod clock;
mod identity_cache;
mod provider;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity_cache::{create_default_cache, CacheStats, IdentityCache, DEFAULT_IDENTITY_TTL};
pub use provider::{
    Identity, IdentityHandle, IdentityProvider, LocalIdentity, LocalIdentityProvider, LoginProvider,
};

#[cfg(test)]
pub use provider::{MockIdentityProvider, MockLoginProvider};
