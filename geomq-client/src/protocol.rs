//! 协议层
//! 会话状态机、订阅登记与应答归并，依赖网络层进行读写

pub use correlator::{AckOutcome, Correlator};
pub use message::{FunctionAction, FunctionMessage, TypeCode};
pub use registry::{ListeningTopic, SubscriptionRegistry};
pub use session::{Session, SessionState};

pub mod correlator;
pub mod message;
pub mod registry;
pub mod session;

/// 客户端角色
/// EDGE/CLOUD 监听函数调用，CLIENT 监听函数结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Client,
    Edge,
    Cloud,
}

/// 返回给调用方的可恢复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Failure,
    /// 订阅的主题已存在，未发起网络往返
    AlreadyExist,
    /// 要退订的主题不存在，未发起网络往返
    NotExist,
    /// 等到了错位的应答，已入队，调用方应换用对应的监听路径重试
    Retry,
}
