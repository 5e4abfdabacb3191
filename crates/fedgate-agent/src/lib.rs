//! FedGate Agent - 网关服务进程
//!
//! 该模块将同步的安全核心嵌入 tokio 运行时：请求动作在阻塞线程池中以解析出的身份执行，
//! 后台任务定期清理过期身份并刷新指标，配置文件变化时自动热重载。

pub mod config;
pub mod logging;
pub mod metrics;

use anyhow::{Context, Result};
use fedgate_common::RequestDescriptor;
use fedgate_security::identity::{Clock, IdentityProvider, LoginProvider, SystemClock};
use fedgate_security::utils::format_duration;
use fedgate_security::{SecurityOptions, SecurityService};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigManager;
use crate::metrics::GatewayMetrics;

/// 网关主结构体
pub struct Gateway {
    /// 配置管理器
    config: Arc<ConfigManager>,
    /// 安全服务
    security: Arc<SecurityService>,
    /// 指标收集器
    metrics: Arc<GatewayMetrics>,
    /// 定期清理任务
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// 创建新的网关实例，使用系统时钟
    pub fn new(
        config: ConfigManager,
        identity_provider: Arc<dyn IdentityProvider>,
        login_provider: Arc<dyn LoginProvider>,
    ) -> Result<Self> {
        Self::with_clock(config, identity_provider, login_provider, Arc::new(SystemClock))
    }

    /// 使用指定时钟创建网关实例
    pub fn with_clock(
        config: ConfigManager,
        identity_provider: Arc<dyn IdentityProvider>,
        login_provider: Arc<dyn LoginProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let gateway_config = config.get_config();
        let options = SecurityOptions {
            identity_ttl: gateway_config.identity_ttl(),
            expand_user_principal: gateway_config.expand_user_principal,
            login_defaults: gateway_config.login_defaults(),
        };
        let security = fedgate_security::init(identity_provider, login_provider, clock, options);
        let metrics = GatewayMetrics::new().context("初始化网关指标失败")?;

        Ok(Self {
            config: Arc::new(config),
            security: Arc::new(security),
            metrics: Arc::new(metrics),
            cleanup_task: Mutex::new(None),
        })
    }

    /// 根据当前配置构造请求描述符
    pub fn descriptor(
        &self,
        segment_id: i32,
        transaction_id: &str,
        user: &str,
        server_name: Option<&str>,
    ) -> Result<RequestDescriptor> {
        let mut descriptor = RequestDescriptor::new(segment_id, transaction_id, user, Default::default())?
            .with_server(server_name.unwrap_or_default(), None);
        descriptor.security = self.config.server_security(&descriptor.server_name);
        Ok(descriptor)
    }

    /// 在阻塞线程池中以请求的有效身份执行动作
    pub async fn handle<T, F>(&self, request: RequestDescriptor, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let security = self.security.clone();
        let joined = tokio::task::spawn_blocking(move || security.run_as(&request, action)).await;

        let outcome = match joined {
            Ok(outcome) => outcome.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e).context("请求任务执行失败")),
        };
        self.metrics.record_request(outcome.is_ok());
        outcome
    }

    /// 启动配置热重载和定期清理任务，需在 tokio 运行时中调用
    pub fn start(&self) -> Result<()> {
        self.config.start_config_watcher()?;

        let mut task = self.cleanup_task.lock();
        if task.is_some() {
            debug!("清理任务已在运行");
            return Ok(());
        }

        let interval = self.config.get_config().cleanup_interval();
        let security = self.security.clone();
        let metrics = self.metrics.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即完成
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cache = security.cache().clone();
                match tokio::task::spawn_blocking(move || {
                    cache.cleanup_expired();
                    cache.stats()
                })
                .await
                {
                    Ok(stats) => metrics.update(&stats),
                    Err(e) => warn!("身份缓存清理任务失败: {}", e),
                }
            }
        }));

        info!("FedGate 网关已启动，清理间隔: {}", format_duration(interval));
        Ok(())
    }

    /// 立即执行一次清理并刷新指标，返回被销毁的身份数
    pub fn sweep(&self) -> usize {
        let cache = self.security.cache();
        let destroyed = cache.cleanup_expired();
        self.metrics.update(&cache.stats());
        destroyed
    }

    /// 停止后台任务并销毁所有未被引用的身份
    pub async fn stop(&self) -> Result<usize> {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.config.stop_config_watcher();

        let security = self.security.clone();
        let destroyed = tokio::task::spawn_blocking(move || security.shutdown())
            .await
            .context("关闭安全服务失败")?;
        self.metrics.update(&self.security.cache().stats());

        info!("FedGate 网关已停止");
        Ok(destroyed)
    }

    /// 安全服务
    pub fn security(&self) -> &SecurityService {
        &self.security
    }

    /// 网关指标
    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// 配置管理器
    pub fn config(&self) -> &ConfigManager {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_default_config;
    use fedgate_common::{Error, ServerSecurityConfig, SessionKey};
    use fedgate_security::identity::{LocalIdentityProvider, ManualClock};
    use std::time::Duration;

    fn gateway_with_clock(clock: Arc<ManualClock>) -> Gateway {
        let mut config = create_default_config();
        config.servers.insert(
            "s3".to_string(),
            ServerSecurityConfig {
                user_impersonation: true,
                ..ServerSecurityConfig::default()
            },
        );
        Gateway::with_clock(
            ConfigManager::from_config(config),
            Arc::new(LocalIdentityProvider),
            Arc::new(LocalIdentityProvider),
            clock,
        )
        .unwrap()
    }

    fn gateway() -> Gateway {
        gateway_with_clock(Arc::new(ManualClock::new()))
    }

    #[test]
    fn test_descriptor_uses_server_configuration() {
        let gateway = gateway();
        let descriptor = gateway.descriptor(2, "txn-1", "alice", Some("s3")).unwrap();
        assert_eq!(descriptor.server_name, "s3");
        assert!(descriptor.impersonation_enabled());

        let descriptor = gateway.descriptor(2, "txn-1", "alice", None).unwrap();
        assert_eq!(descriptor.server_name, "default");
        assert!(!descriptor.impersonation_enabled());

        assert!(gateway.descriptor(2, "", "alice", None).is_err());
    }

    #[tokio::test]
    async fn test_handle_runs_action_and_keeps_identity_cached() {
        let gateway = gateway();
        let request = gateway.descriptor(2, "txn-1", "alice", Some("s3")).unwrap();
        let value = gateway.handle(request, || Ok(7)).await.unwrap();
        assert_eq!(value, 7);

        let cache = gateway.security().cache();
        assert!(cache.contains(&SessionKey::new(2, "txn-1", "alice")));
        assert!(gateway.metrics().render().unwrap().contains("fedgate_requests_total 1"));
    }

    #[tokio::test]
    async fn test_last_fragment_evicts_segment() {
        let gateway = gateway();
        let request = gateway
            .descriptor(2, "txn-1", "alice", Some("s3"))
            .unwrap()
            .with_last_fragment(true);
        gateway.handle(request, || Ok(())).await.unwrap();
        assert_eq!(gateway.security().cache().size(), 0);
    }

    #[tokio::test]
    async fn test_action_errors_keep_their_kind() {
        let gateway = gateway();
        let request = gateway.descriptor(2, "txn-1", "alice", Some("s3")).unwrap();
        let err = gateway
            .handle(request, || -> anyhow::Result<()> {
                Err(Error::Interrupted("query cancelled".to_string()).into())
            })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Error>().map_or(false, Error::is_interrupted));
        assert!(gateway.metrics().render().unwrap().contains("fedgate_request_failures_total 1"));
    }

    #[tokio::test]
    async fn test_panicking_action_is_reported_and_released() {
        let gateway = gateway();
        let request = gateway
            .descriptor(2, "txn-1", "alice", Some("s3"))
            .unwrap()
            .with_last_fragment(true);
        let result = gateway
            .handle(request, || -> anyhow::Result<()> { panic!("connector bug") })
            .await;
        assert!(result.is_err());
        assert_eq!(gateway.security().cache().size(), 0);
    }

    #[tokio::test]
    async fn test_sweep_destroys_expired_identities() {
        let clock = Arc::new(ManualClock::new());
        let gateway = gateway_with_clock(clock.clone());
        let request = gateway.descriptor(2, "txn-1", "alice", None).unwrap();
        gateway.handle(request, || Ok(())).await.unwrap();

        assert_eq!(gateway.sweep(), 0);
        clock.advance(Duration::from_secs(15 * 60 + 1));
        assert_eq!(gateway.sweep(), 1);
        assert!(gateway
            .metrics()
            .render()
            .unwrap()
            .contains("fedgate_identity_cache_entries 0"));
    }

    #[test_log::test(tokio::test)]
    async fn test_start_and_stop() {
        let gateway = gateway();
        gateway.start().unwrap();
        gateway.start().unwrap();

        let request = gateway.descriptor(2, "txn-1", "alice", Some("s3")).unwrap();
        gateway.handle(request, || Ok(())).await.unwrap();

        assert_eq!(gateway.stop().await.unwrap(), 1);
        assert_eq!(gateway.security().cache().size(), 0);
    }
}
