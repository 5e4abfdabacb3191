//! 配置管理模块
//!
//! 该模块负责加载和管理网关的配置文件，支持 YAML/JSON 格式，
//! 并实现配置热重载功能：服务器安全配置的变化在下一个请求生效，无需重启服务。

use anyhow::{anyhow, Context, Result};
use config::{Config, File, FileFormat};
use fedgate_common::ServerSecurityConfig;
use fedgate_security::LoginDefaults;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// 网关配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 日志级别
    pub log_level: String,
    /// 未被引用身份的有效期（秒）
    pub identity_ttl_secs: u64,
    /// 定期清理间隔（秒）
    pub cleanup_interval_secs: u64,
    /// 安全模式下模拟用户时是否追加 realm
    pub expand_user_principal: bool,
    /// 默认服务器的 Kerberos 主体
    pub default_principal: Option<String>,
    /// 默认服务器的 keytab 路径
    pub default_keytab: Option<PathBuf>,
    /// 各服务器的安全配置
    pub servers: HashMap<String, ServerSecurityConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        create_default_config()
    }
}

impl GatewayConfig {
    /// 身份有效期
    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_secs)
    }

    /// 清理间隔，至少 1 秒
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// 获取服务器安全配置，未配置的服务器使用默认值
    ///
    /// 服务器名称不区分大小写，精确匹配优先。
    pub fn server(&self, name: &str) -> ServerSecurityConfig {
        self.servers
            .get(name)
            .or_else(|| {
                self.servers
                    .iter()
                    .find(|(configured, _)| configured.eq_ignore_ascii_case(name))
                    .map(|(_, security)| security)
            })
            .cloned()
            .unwrap_or_default()
    }

    /// 默认服务器的网关级凭据
    pub fn login_defaults(&self) -> LoginDefaults {
        LoginDefaults {
            principal: self.default_principal.clone(),
            keytab: self.default_keytab.clone(),
        }
    }
}

/// 配置文件格式
fn file_format(config_path: &Path) -> Result<FileFormat> {
    match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
    }
}

/// 配置管理器
pub struct ConfigManager {
    /// 配置文件路径，内存配置时为空
    config_path: Option<PathBuf>,
    /// 当前配置
    config: Arc<RwLock<GatewayConfig>>,
    /// 文件监听器，需保持存活
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigManager {
    /// 从配置文件创建配置管理器
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let config_path = fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());

        let config = Self::load_config(&config_path)
            .with_context(|| format!("无法加载配置文件: {:?}", config_path))?;
        info!("已从 {:?} 加载网关配置，共 {} 个服务器", config_path, config.servers.len());

        Ok(Self {
            config_path: Some(config_path),
            config: Arc::new(RwLock::new(config)),
            watcher: Mutex::new(None),
        })
    }

    /// 使用内存中的配置创建配置管理器
    pub fn from_config(config: GatewayConfig) -> Self {
        Self {
            config_path: None,
            config: Arc::new(RwLock::new(config)),
            watcher: Mutex::new(None),
        }
    }

    /// 加载配置文件
    fn load_config(config_path: &Path) -> Result<GatewayConfig> {
        let format = file_format(config_path)?;

        let config = Config::builder()
            .add_source(File::from(config_path).format(format))
            .build()
            .context("构建配置失败")?;

        let gateway_config = config
            .try_deserialize::<GatewayConfig>()
            .context("配置格式错误")?;

        Ok(gateway_config)
    }

    /// 重新加载配置文件
    pub fn reload(&self) -> Result<()> {
        let Some(config_path) = &self.config_path else {
            return Ok(());
        };
        let new_config = Self::load_config(config_path)?;
        *self.config.write() = new_config;
        info!("配置热重载成功");
        Ok(())
    }

    /// 启动配置文件监听器，实现热重载
    pub fn start_config_watcher(&self) -> Result<()> {
        let Some(config_path) = self.config_path.clone() else {
            debug!("内存配置无需监听");
            return Ok(());
        };
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return Ok(());
        }

        let config_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let config = self.config.clone();
        let watched_path = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                // 只处理配置文件的创建和修改事件
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                if !event.paths.iter().any(|p| p == &watched_path) {
                    return;
                }
                info!("检测到配置文件变更，正在重新加载...");
                match Self::load_config(&watched_path) {
                    Ok(new_config) => {
                        *config.write() = new_config;
                        info!("配置热重载成功");
                    }
                    Err(e) => error!("重新加载配置文件失败: {:#}", e),
                }
            }
            Err(e) => error!("监听配置文件错误: {}", e),
        })
        .context("创建配置文件监听器失败")?;

        watcher
            .watch(&config_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("无法监听配置目录: {:?}", config_dir))?;
        info!("已启动配置文件监听: {:?}", config_path);

        *guard = Some(watcher);
        Ok(())
    }

    /// 停止配置文件监听
    pub fn stop_config_watcher(&self) {
        if self.watcher.lock().take().is_some() {
            debug!("配置文件监听已停止");
        }
    }

    /// 获取服务器安全配置
    pub fn server_security(&self, server_name: &str) -> ServerSecurityConfig {
        self.config.read().server(server_name)
    }

    /// 获取完整配置
    pub fn get_config(&self) -> GatewayConfig {
        self.config.read().clone()
    }

    /// 配置文件路径
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// 创建默认配置
pub fn create_default_config() -> GatewayConfig {
    GatewayConfig {
        log_level: "info".to_string(),
        identity_ttl_secs: 15 * 60,
        cleanup_interval_secs: 60,
        expand_user_principal: true,
        default_principal: None,
        default_keytab: None,
        servers: HashMap::new(),
    }
}

/// 按扩展名将配置写入 YAML 或 JSON 文件
pub fn write_config(config_path: &Path, config: &GatewayConfig) -> Result<()> {
    let content = match file_format(config_path)? {
        FileFormat::Json => serde_json::to_string_pretty(config).context("序列化 JSON 配置失败")?,
        _ => serde_yaml::to_string(config).context("序列化 YAML 配置失败")?,
    };
    fs::write(config_path, content).with_context(|| format!("无法写入配置文件: {:?}", config_path))?;
    Ok(())
}
