//! 服务登录会话模块
//!
//! 按服务器名称缓存网关自身的登录身份。安全模式下使用 keytab 进行 Kerberos 登录，
//! 并按配置的最小间隔定期重新登录；非安全模式下以配置的服务用户或进程用户登录。
//! 当服务器的登录配置（配置目录、主体、keytab 等）发生变化时，旧会话作废并重新登录。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fedgate_common::{Error, RequestDescriptor, Result, DEFAULT_SERVER_NAME};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::identity::{Clock, IdentityHandle, LoginProvider};

/// 网关级别的默认 Kerberos 凭据，仅用于名为 `default` 的服务器
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginDefaults {
    /// 默认服务主体
    pub principal: Option<String>,
    /// 默认 keytab 路径
    pub keytab: Option<PathBuf>,
}

/// 登录配置指纹，任一字段变化都会使已有会话失效
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoginFingerprint {
    config_dir: String,
    principal: Option<String>,
    keytab: Option<PathBuf>,
    kerberos_enabled: bool,
    service_user: Option<String>,
}

/// 某个服务器的登录会话
#[derive(Debug)]
struct LoginSession {
    fingerprint: LoginFingerprint,
    login: IdentityHandle,
    /// 最近一次登录或重新登录尝试的时间
    last_login: Instant,
}

/// 按服务器缓存的登录身份
pub struct SecureLogin {
    provider: Arc<dyn LoginProvider>,
    clock: Arc<dyn Clock>,
    defaults: LoginDefaults,
    sessions: Mutex<HashMap<String, LoginSession>>,
}

impl SecureLogin {
    /// 创建新的登录会话缓存
    pub fn new(provider: Arc<dyn LoginProvider>, clock: Arc<dyn Clock>, defaults: LoginDefaults) -> Self {
        Self {
            provider,
            clock,
            defaults,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 获取请求目标服务器的登录身份
    ///
    /// 首次使用或配置变化时登录；安全模式下距上次登录超过最小间隔时重新登录。
    pub fn login_user(&self, request: &RequestDescriptor) -> Result<IdentityHandle> {
        let server = request.server_name.as_str();
        let fingerprint = self.fingerprint(request);
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(server) {
            if existing.fingerprint != fingerprint {
                warn!(
                    "服务器 {} 的登录配置已变化，现有会话 {:?}，期望 {:?}",
                    server, existing.fingerprint, fingerprint
                );
                sessions.remove(server);
            }
        }

        let session = match sessions.entry(server.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.login(server, fingerprint)?),
        };

        if session.fingerprint.kerberos_enabled {
            let min_interval = Duration::from_secs(request.security.min_relogin_seconds);
            self.relogin_if_due(server, session, min_interval)?;
        }

        Ok(session.login.clone())
    }

    /// 已登录的服务器数量
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn login(&self, server: &str, fingerprint: LoginFingerprint) -> Result<LoginSession> {
        let login = if fingerprint.kerberos_enabled {
            info!("服务器 {} 已启用 Kerberos 安全认证", server);
            let principal = fingerprint.principal.as_deref().ok_or_else(|| {
                Error::Config(format!("服务器 {} 启用了 Kerberos，但未配置有效的主体", server))
            })?;
            let keytab = fingerprint.keytab.as_deref().ok_or_else(|| {
                Error::Config(format!("服务器 {} 启用了 Kerberos，但未配置有效的 keytab 文件", server))
            })?;
            ensure_readable_keytab(server, keytab)?;

            info!("服务器 {} 的 Kerberos 主体: {}", server, principal);
            info!("服务器 {} 的 Kerberos keytab: {}", server, keytab.display());
            let login = self.provider.login_from_keytab(server, principal, keytab)?;
            info!("已以主体 {} 登录服务器 {}", login.user_name(), server);
            login
        } else {
            let user = fingerprint
                .service_user
                .clone()
                .unwrap_or_else(whoami::username);
            debug!("服务器 {} 未启用安全认证，以用户 {} 登录", server, user);
            self.provider.login_user(&user)?
        };

        Ok(LoginSession {
            fingerprint,
            login,
            last_login: self.clock.now(),
        })
    }

    fn relogin_if_due(&self, server: &str, session: &mut LoginSession, min_interval: Duration) -> Result<()> {
        let now = self.clock.now();
        if now.duration_since(session.last_login) < min_interval {
            return Ok(());
        }

        session.last_login = now;
        debug!("为服务器 {} 重新登录 {}", server, session.login.user_name());
        self.provider
            .relogin_from_keytab(&session.login)
            .map_err(|e| match e {
                Error::Authentication(_) => e,
                other => Error::Authentication(format!("服务器 {} 重新登录失败: {}", server, other)),
            })
    }

    fn fingerprint(&self, request: &RequestDescriptor) -> LoginFingerprint {
        let security = &request.security;
        let is_default = request.server_name.eq_ignore_ascii_case(DEFAULT_SERVER_NAME);

        let principal = security
            .principal_name()
            .map(str::to_string)
            .or_else(|| is_default.then(|| self.defaults.principal.clone()).flatten());
        let keytab = security
            .keytab
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(|| is_default.then(|| self.defaults.keytab.clone()).flatten());

        LoginFingerprint {
            config_dir: request.config_dir.clone(),
            principal,
            keytab,
            kerberos_enabled: security.kerberos_enabled,
            service_user: security.service_user_name().map(str::to_string),
        }
    }
}

/// keytab 必须是可读的普通文件
fn ensure_readable_keytab(server: &str, keytab: &Path) -> Result<()> {
    let metadata = fs::metadata(keytab).map_err(|e| {
        Error::Config(format!("服务器 {} 的 keytab 文件 {} 不可访问: {}", server, keytab.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(Error::Config(format!(
            "服务器 {} 的 keytab {} 不是文件",
            server,
            keytab.display()
        )));
    }
    File::open(keytab).map_err(|e| {
        Error::Config(format!("服务器 {} 的 keytab 文件 {} 不可读: {}", server, keytab.display(), e))
    })?;
    Ok(())
}
