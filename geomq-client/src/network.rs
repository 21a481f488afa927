//! 网络层
//! 只负责与单个 broker 之间的请求/应答读写，不包含任何协议逻辑

use std::time::Duration;

use async_trait::async_trait;
use tokio::io;

pub use conn::{TcpConnector, TcpTransport};

use self::payload::Payload;

pub mod conn;
pub mod payload;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Payload error: {0}")]
    Payload(#[from] payload::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Connection closed by broker")]
    ConnectionAborted,
}

/// 绑定到单个 broker 的请求/应答通道
/// 由会话持有；broker 迁移时整体替换，不在调用方之间共享
#[async_trait]
pub trait Transport: Send {
    /// 发送一个请求报文
    async fn send(&mut self, payload: Payload) -> Result<(), Error>;

    /// 阻塞等待下一个应答
    async fn receive(&mut self) -> Result<Payload, Error>;

    /// 限时等待应答，超时返回 None
    /// timeout 为零表示一直阻塞
    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Payload>, Error>;

    /// 有界拆除：关闭连接并等待后台任务退出
    /// 返回 false 表示期限内仍有任务在运行
    async fn tear_down(&mut self, wait: Duration) -> bool;
}

/// 打开新 Transport 的工厂
/// broker 迁移需要在旧连接仍然存活时建立新连接
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn open(&self, host: &str, port: u16) -> Result<Self::Transport, Error>;
}
