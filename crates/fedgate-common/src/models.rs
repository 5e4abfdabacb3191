//! 数据模型模块
//!
//! 该模块定义了 FedGate 项目中使用的核心数据模型，包括会话键、
//! 请求描述符和服务器安全配置，并提供序列化/反序列化功能。

pub mod session;
pub mod request;
