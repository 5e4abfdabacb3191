//! 安全服务
//!
//! 以解析出的身份执行请求动作：解析身份、从缓存获取身份、执行动作，
//! 并在任何退出路径（包括 panic 展开）上恰好释放一次缓存引用。

use std::fmt;
use std::sync::Arc;

use fedgate_common::{Error, RequestDescriptor, Result, SessionKey};
use tracing::{debug, error, info};

use crate::identity::IdentityCache;
use crate::policy::IdentityResolutionPolicy;

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Resolving,
    Acquired,
    Running,
    Releasing,
    Done,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestPhase::Resolving => "解析身份",
            RequestPhase::Acquired => "已获取身份",
            RequestPhase::Running => "执行动作",
            RequestPhase::Releasing => "释放身份",
            RequestPhase::Done => "完成",
        };
        f.write_str(name)
    }
}

/// 缓存引用租约，drop 时释放
struct IdentityLease<'a> {
    cache: &'a IdentityCache,
    key: SessionKey,
    force_cleanup: bool,
}

impl Drop for IdentityLease<'_> {
    fn drop(&mut self) {
        debug!("{} [{}]", self.key, RequestPhase::Releasing);
        if let Err(e) = self.cache.release(&self.key, self.force_cleanup) {
            error!("释放会话 {} 失败: {}", self.key, e);
        }
        debug!("{} [{}]", self.key, RequestPhase::Done);
    }
}

/// 安全服务
pub struct SecurityService {
    policy: IdentityResolutionPolicy,
    cache: Arc<IdentityCache>,
}

impl SecurityService {
    /// 创建新的安全服务
    pub fn new(policy: IdentityResolutionPolicy, cache: Arc<IdentityCache>) -> Self {
        Self { policy, cache }
    }

    /// 身份缓存
    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// 以请求的有效身份执行动作
    ///
    /// 身份解析和获取失败时直接返回错误，此时不会释放任何引用。
    /// 动作返回的中断错误保持为 [`Error::Interrupted`]，其余失败包装为 [`Error::Action`]。
    /// 释放失败只记录日志，不会覆盖动作的结果。
    pub fn run_as<T, F>(&self, request: &RequestDescriptor, action: F) -> Result<T>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        debug!(
            "段 {} 事务 {} 用户 {} [{}]",
            request.segment_id,
            request.transaction_id,
            request.user,
            RequestPhase::Resolving
        );
        let resolved = self.policy.resolve(request)?;
        let key = SessionKey::new(request.segment_id, &request.transaction_id, &resolved.user);

        let identity = self
            .cache
            .acquire(&key, &resolved.login, resolved.impersonate, resolved.kerberos)?;
        let lease = IdentityLease {
            cache: &self.cache,
            key,
            force_cleanup: request.last_fragment,
        };
        debug!("{} [{}]", lease.key, RequestPhase::Acquired);

        let mut action = Some(action);
        let mut output = None;
        debug!("{} [{}]", lease.key, RequestPhase::Running);
        let outcome = identity.run_as(&mut || {
            let action = action
                .take()
                .ok_or_else(|| anyhow::anyhow!("请求动作只能执行一次"))?;
            output = Some(action()?);
            Ok(())
        });
        drop(lease);

        match outcome {
            Ok(()) => output.ok_or_else(|| Error::Action(anyhow::anyhow!("身份未执行请求动作"))),
            Err(e) => Err(Error::from_action(e)),
        }
    }

    /// 关闭服务，销毁所有未被引用的身份
    pub fn shutdown(&self) -> usize {
        let destroyed = self.cache.drain();
        info!("安全服务已关闭，销毁 {} 个缓存身份", destroyed);
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        IdentityProvider, LocalIdentityProvider, ManualClock, MockIdentityProvider, DEFAULT_IDENTITY_TTL,
    };
    use crate::policy::create_default_policy;
    use fedgate_common::ServerSecurityConfig;
    use std::panic::{self, AssertUnwindSafe};

    fn service_with(provider: Arc<dyn IdentityProvider>) -> SecurityService {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(IdentityCache::new(provider, clock.clone(), DEFAULT_IDENTITY_TTL));
        SecurityService::new(create_default_policy(Arc::new(LocalIdentityProvider), clock), cache)
    }

    fn service() -> SecurityService {
        service_with(Arc::new(LocalIdentityProvider))
    }

    fn request(transaction_id: &str) -> RequestDescriptor {
        let security = ServerSecurityConfig {
            user_impersonation: true,
            ..ServerSecurityConfig::default()
        };
        RequestDescriptor::new(1, transaction_id, "alice", security).unwrap()
    }

    fn key(transaction_id: &str) -> SessionKey {
        SessionKey::new(1, transaction_id, "alice")
    }

    #[test]
    fn test_run_as_returns_action_output_and_releases() {
        let service = service();
        let value = service.run_as(&request("txn-1"), || Ok(42)).unwrap();
        assert_eq!(value, 42);

        assert!(service.cache().contains(&key("txn-1")));
        // 租约已释放，引用计数为零
        assert!(matches!(
            service.cache().release(&key("txn-1"), false),
            Err(Error::NotInCache(_))
        ));
    }

    #[test]
    fn test_identity_is_shared_while_in_flight() {
        let service = service();
        let nested = service
            .run_as(&request("txn-1"), || {
                let inner = service.run_as(&request("txn-1"), || Ok(service.cache().size()))?;
                Ok(inner)
            })
            .unwrap();
        assert_eq!(nested, 1);
        assert_eq!(service.cache().stats().constructions, 1);
        assert_eq!(service.cache().stats().hits, 1);
    }

    #[test]
    fn test_last_fragment_cleans_up_the_segment() {
        let service = service();
        service.run_as(&request("txn-1"), || Ok(())).unwrap();
        assert_eq!(service.cache().size(), 1);

        service
            .run_as(&request("txn-1").with_last_fragment(true), || Ok(()))
            .unwrap();
        assert_eq!(service.cache().size(), 0);
    }

    #[test]
    fn test_two_transactions_get_two_entries() {
        let service = service();
        service.run_as(&request("txn-1"), || Ok(())).unwrap();
        service.run_as(&request("txn-2"), || Ok(())).unwrap();
        assert_eq!(service.cache().size(), 2);
        assert!(service.cache().contains(&key("txn-1")));
        assert!(service.cache().contains(&key("txn-2")));
    }

    #[test]
    fn test_action_error_is_wrapped_and_released() {
        let service = service();
        let result: Result<()> = service.run_as(&request("txn-1"), || Err(anyhow::anyhow!("read failed")));
        assert!(matches!(result, Err(Error::Action(_))));
        assert!(service.cache().release(&key("txn-1"), false).is_err());
    }

    #[test]
    fn test_interruption_is_surfaced_and_released() {
        let service = service();
        let result: Result<()> = service.run_as(&request("txn-1"), || {
            Err(Error::Interrupted("worker cancelled".to_string()).into())
        });
        assert!(result.unwrap_err().is_interrupted());
        assert!(service.cache().release(&key("txn-1"), false).is_err());
    }

    #[test]
    fn test_panicking_action_still_releases() {
        let service = service();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            service.run_as(&request("txn-1").with_last_fragment(true), || -> anyhow::Result<()> {
                panic!("connector bug")
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(service.cache().size(), 0);
        assert_eq!(service.cache().stats().destroyed, 1);
    }

    #[test_log::test]
    fn test_release_error_does_not_mask_result() {
        let service = service();
        let value = service
            .run_as(&request("txn-1"), || {
                service.cache().release(&key("txn-1"), false)?;
                Ok("done")
            })
            .unwrap();
        assert_eq!(value, "done");
    }

    #[test]
    fn test_construction_error_propagates_without_release() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_create_proxy_identity()
            .times(1)
            .returning(|user, _| Err(Error::Identity(format!("cannot impersonate {}", user))));
        provider.expect_destroy().never();

        let service = service_with(Arc::new(provider));
        let mut ran = false;
        let result = service.run_as(&request("txn-1"), || {
            ran = true;
            Ok(())
        });
        assert!(matches!(result, Err(Error::Identity(_))));
        assert!(!ran);
        assert_eq!(service.cache().size(), 0);
    }

    #[test]
    fn test_resolution_error_acquires_nothing() {
        let service = service();
        let mut security = request("txn-1").security;
        security.constrained_delegation = true;
        let request = RequestDescriptor::new(1, "txn-1", "alice", security).unwrap();

        assert!(matches!(service.run_as(&request, || Ok(())), Err(Error::Config(_))));
        assert_eq!(service.cache().stats().misses, 0);
    }

    #[test]
    fn test_shutdown_drains_idle_identities() {
        let service = service();
        service.run_as(&request("txn-1"), || Ok(())).unwrap();
        service.run_as(&request("txn-2"), || Ok(())).unwrap();
        assert_eq!(service.shutdown(), 2);
        assert_eq!(service.cache().size(), 0);
    }
}
