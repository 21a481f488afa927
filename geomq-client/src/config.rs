use tokio::{fs, io::AsyncReadExt};

use crate::{network::payload::BrokerInfo, protocol::ClientType};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    IO(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    pub broker: Broker,
    pub session: Session,
}

/// 初始连接的 broker 地址
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Broker {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Session {
    /// 客户端 id，在集群内必须唯一
    pub client_id: String,
    /// 客户端角色，决定函数主题的订阅展开
    pub mode: ClientType,
    /// 握手及各次应答等待的超时（毫秒）
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 拆除传输时等待后台任务退出的期限（毫秒）
    #[serde(default = "default_teardown_wait_ms")]
    pub teardown_wait_ms: u64,
}

fn default_port() -> u16 {
    5559
}

fn default_connect_timeout_ms() -> u64 {
    8000
}

fn default_teardown_wait_ms() -> u64 {
    3000
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Ok(toml::from_str::<Config>(&s)?)
    }

    /// 配置的 broker 标识
    /// 握手前还不知道对端上报的 broker id，先用地址代替
    pub fn broker_info(&self) -> BrokerInfo {
        BrokerInfo {
            broker_id: format!("{}:{}", self.broker.host, self.broker.port),
            host: self.broker.host.clone(),
            port: self.broker.port,
        }
    }
}
