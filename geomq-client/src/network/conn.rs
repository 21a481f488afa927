use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
    time,
};

use super::{
    payload::{self, Payload},
    Connector, Error, Transport,
};

/// 与单个 broker 的 tcp 连接
/// 写方向直接操作 socket；读方向由后台任务负责，
/// 以完整的 payload 为单位投递到 channel
pub struct TcpTransport {
    /// 写半边；拆除时关闭以通知对端
    write_half: Option<OwnedWriteHalf>,
    /// 写缓冲区
    /// 先写入缓冲区再整体刷入 socket
    write: BytesMut,
    incoming_rx: Receiver<Payload>,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// 建立 tcp 连接并启动后台读任务
    pub async fn open(host: &str, port: u16) -> Result<Self, Error> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();
        let (incoming_tx, incoming_rx) = mpsc::channel(1000);

        let reader = tokio::spawn(async move {
            if let Err(e) = read_loop(read_half, incoming_tx).await {
                debug!("transport read loop exit: {:?}", e);
            }
        });

        Ok(Self {
            write_half: Some(write_half),
            write: BytesMut::new(),
            incoming_rx,
            reader: Some(reader),
        })
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.write.is_empty() {
            return Ok(());
        }

        let write_half = self.write_half.as_mut().ok_or(Error::ConnectionAborted)?;
        write_half.write_all(&self.write).await?;
        self.write.clear();
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, payload: Payload) -> Result<(), Error> {
        payload.write(&mut self.write)?;
        self.flush().await
    }

    async fn receive(&mut self) -> Result<Payload, Error> {
        self.incoming_rx.recv().await.ok_or(Error::ConnectionAborted)
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Payload>, Error> {
        if timeout.is_zero() {
            return Ok(Some(self.receive().await?));
        }

        match time::timeout(timeout, self.incoming_rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(Error::ConnectionAborted),
            // 超时不是错误，交给调用方判定
            Err(_) => Ok(None),
        }
    }

    async fn tear_down(&mut self, wait: Duration) -> bool {
        // 关闭写方向，对端关闭连接后读任务随之退出
        drop(self.write_half.take());
        self.incoming_rx.close();

        match self.reader.take() {
            Some(handle) => time::timeout(wait, handle).await.is_ok(),
            None => true,
        }
    }
}

/// 从 socket 循环读出完整的帧
async fn read_loop(mut read_half: OwnedReadHalf, tx: Sender<Payload>) -> Result<(), Error> {
    let mut read = BytesMut::new();
    loop {
        let required = match Payload::read_from(&mut read) {
            Ok(payload) => {
                // 接收端已关闭，正常退出
                if tx.send(payload).await.is_err() {
                    return Ok(());
                }
                continue;
            }
            Err(payload::Error::InsufficientBytes(n)) => n,
            Err(e) => return Err(Error::Payload(e)),
        };

        // 数据不足，继续从 socket 读
        read_bytes(&mut read_half, &mut read, required).await?;
    }
}

/// 等待从 socket 读出至少所需长度的数据，放入缓冲区
async fn read_bytes(
    stream: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    required: usize,
) -> Result<(), Error> {
    let mut total_read = 0;
    loop {
        let read = stream.read_buf(buf).await?;
        if 0 == read {
            return Err(Error::ConnectionAborted);
        }

        total_read += read;
        if total_read >= required {
            return Ok(());
        }
    }
}

/// 默认的 tcp 工厂
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn open(&self, host: &str, port: u16) -> Result<TcpTransport, Error> {
        TcpTransport::open(host, port).await
    }
}
