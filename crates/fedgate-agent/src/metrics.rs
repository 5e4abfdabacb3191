//! 指标收集与导出模块
//!
//! 该模块负责收集身份缓存的统计数据和请求计数，
//! 并以 Prometheus 文本格式导出监控指标。

use anyhow::{Context, Result};
use fedgate_security::CacheStats;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// 网关指标
pub struct GatewayMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 当前缓存条目数
    cache_entries: IntGauge,
    /// 过期队列记录数
    queued_records: IntGauge,
    /// 缓存命中次数
    cache_hits: IntGauge,
    /// 缓存未命中次数
    cache_misses: IntGauge,
    /// 已创建的身份数
    constructions: IntGauge,
    /// 已销毁的身份数
    destroyed: IntGauge,
    /// 销毁失败的身份数
    destroy_failures: IntGauge,
    /// 处理的请求总数
    requests_total: IntCounter,
    /// 失败的请求总数
    request_failures_total: IntCounter,
}

impl GatewayMetrics {
    /// 创建新的网关指标并注册到独立的注册表
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(name, help).with_context(|| format!("创建指标 {} 失败", name))?;
            registry
                .register(Box::new(gauge.clone()))
                .with_context(|| format!("注册指标 {} 失败", name))?;
            Ok(gauge)
        };
        let cache_entries = gauge("fedgate_identity_cache_entries", "Number of cached session identities")?;
        let queued_records = gauge(
            "fedgate_identity_cache_queued_records",
            "Number of records in the identity expiration queues",
        )?;
        let cache_hits = gauge("fedgate_identity_cache_hits", "Acquisitions served from the identity cache")?;
        let cache_misses = gauge("fedgate_identity_cache_misses", "Acquisitions that required a new identity")?;
        let constructions = gauge("fedgate_identity_constructions", "Identities successfully constructed")?;
        let destroyed = gauge("fedgate_identity_destroyed", "Identities destroyed by the cache")?;
        let destroy_failures = gauge("fedgate_identity_destroy_failures", "Identities whose destruction failed")?;

        let requests_total = IntCounter::new("fedgate_requests_total", "Total number of requests processed")
            .context("创建请求计数器失败")?;
        let request_failures_total =
            IntCounter::new("fedgate_request_failures_total", "Total number of failed requests")
                .context("创建失败请求计数器失败")?;
        registry
            .register(Box::new(requests_total.clone()))
            .context("注册请求计数器失败")?;
        registry
            .register(Box::new(request_failures_total.clone()))
            .context("注册失败请求计数器失败")?;

        Ok(Self {
            registry,
            cache_entries,
            queued_records,
            cache_hits,
            cache_misses,
            constructions,
            destroyed,
            destroy_failures,
            requests_total,
            request_failures_total,
        })
    }

    /// 以缓存统计快照刷新指标
    pub fn update(&self, stats: &CacheStats) {
        self.cache_entries.set(stats.entries as i64);
        self.queued_records.set(stats.queued as i64);
        self.cache_hits.set(stats.hits as i64);
        self.cache_misses.set(stats.misses as i64);
        self.constructions.set(stats.constructions as i64);
        self.destroyed.set(stats.destroyed as i64);
        self.destroy_failures.set(stats.destroy_failures as i64);
    }

    /// 记录一次请求
    pub fn record_request(&self, succeeded: bool) {
        self.requests_total.inc();
        if !succeeded {
            self.request_failures_total.inc();
        }
    }

    /// Prometheus 注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 以 Prometheus 文本格式导出所有指标
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("编码 Prometheus 指标失败")?;
        String::from_utf8(buffer).context("指标输出不是有效的 UTF-8")
    }
}
