use crate::network::{
    self,
    payload::{BrokerInfo, ReasonCode},
};

/// 致命错误：会话无法建立或已不可用
/// 调用方不应自动重试；稳态的可恢复结果见 protocol::StatusCode
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network conn error: {0}")]
    Network(#[from] network::Error),
    #[error("{reason:?}: broker {broker} refused the connection")]
    ConnectionRefused {
        broker: BrokerInfo,
        reason: ReasonCode,
    },
    #[error("Connect timeout, broker {0} unreachable")]
    ConnectTimeout(BrokerInfo),
    #[error("Unexpected reply while {0}")]
    UnexpectedReply(&'static str),
    #[error("No broker is responsible for the current location")]
    NoResponsibleBroker,
    #[error("Migration to {0} failed after the local location was committed")]
    MigrationFailed(BrokerInfo),
    #[error("Function message codec error: {0}")]
    Message(#[from] crate::protocol::message::Error),
}
