//! 错误处理模块
//!
//! 该模块提供 FedGate 项目的统一错误处理机制。身份缓存、登录会话和
//! 安全服务的所有失败都归入同一个错误类型，便于调用方区分处理与日志记录。

use thiserror::Error;

use crate::models::session::SessionKey;

/// FedGate 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误（致命，不重试）
    #[error("配置错误: {0}")]
    Config(String),

    /// 身份验证错误（Kerberos 登录或重新登录失败）
    #[error("身份验证错误: {0}")]
    Authentication(String),

    /// 身份创建错误
    #[error("身份创建错误: {0}")]
    Identity(String),

    /// 缓存一致性错误：释放了不在缓存中的会话
    #[error("缓存中不存在会话条目: {0}")]
    NotInCache(SessionKey),

    /// 请求描述符无效
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// 请求动作被中断
    #[error("请求动作被中断: {0}")]
    Interrupted(String),

    /// 请求动作执行失败
    #[error("请求动作执行失败: {0}")]
    Action(#[source] anyhow::Error),
}

impl Error {
    /// 是否为中断类错误
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }

    /// 将动作返回的错误归类
    ///
    /// 动作内部可能直接返回 [`Error`]（例如身份实现报告中断），
    /// 这类错误保持原样；其余错误统一包装为 [`Error::Action`]。
    pub fn from_action(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::Action(err),
        }
    }
}

/// FedGate 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_survives_anyhow_round_trip() {
        let err = anyhow::Error::new(Error::Interrupted("worker cancelled".to_string()));
        let classified = Error::from_action(err);
        assert!(classified.is_interrupted());
    }

    #[test]
    fn test_foreign_error_becomes_action() {
        let classified = Error::from_action(anyhow::anyhow!("connector failed"));
        match classified {
            Error::Action(inner) => assert_eq!(inner.to_string(), "connector failed"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_not_in_cache_message_names_session() {
        let key = SessionKey::new(3, "txn-7", "alice");
        let message = Error::NotInCache(key).to_string();
        assert!(message.contains("segment=3"));
        assert!(message.contains("txn-7"));
    }
}
