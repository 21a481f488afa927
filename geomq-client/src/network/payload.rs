//! 会话层的报文模型
//! 请求与应答统一用 Payload 表示
//! 帧格式：4 字节大端长度前缀 + JSON 正文

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

const PAYLOAD_MAX_LENGTH: usize = 268_435_455;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// 经纬度坐标
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// 订阅携带的地理围栏
/// 对会话层不透明，只随请求原样传递
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Geofence {
    /// 圆形围栏：中心点 + 半径（度）
    Circle { center: Location, radius: f64 },
    /// 多边形围栏，顶点按顺序闭合
    Polygon { points: Vec<Location> },
}

/// 层级主题，如 functions/f1/call
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Topic(pub String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// 第一层路径段，决定消息的命名空间
    pub fn first_level(&self) -> &str {
        self.0.split('/').next().unwrap_or("")
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// broker 标识
/// 既描述当前连接的 broker，也用于服务端建议的迁移目标
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BrokerInfo {
    pub broker_id: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.broker_id, self.host, self.port)
    }
}

/// 应答携带的结果码
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReasonCode {
    NormalDisconnection,
    ProtocolError,
    NotConnectedOrNoLocation,
    GrantedQoS0,
    Success,
    NoMatchingSubscribers,
    NoSubscriptionExisted,
    LocationUpdated,
    WrongBroker,
    /// 本地没有订阅者，但消息已转发给其它 broker
    NoMatchingSubscribersButForwarded,
}

/// 客户端与 broker 之间的全部报文
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Payload {
    /// 携带客户端 id，broker 据此辨识会话并拒绝重复的 id
    Connect {
        client_id: String,
        location: Location,
    },
    ConnAck {
        reason_code: ReasonCode,
    },
    /// 服务端拒绝或驱逐连接；可能附带建议改连的 broker
    Disconnect {
        reason_code: ReasonCode,
        broker_info: Option<BrokerInfo>,
    },
    Subscribe {
        topic: Topic,
        fence: Geofence,
    },
    SubAck {
        reason_code: ReasonCode,
    },
    Unsubscribe {
        topic: Topic,
    },
    UnsubAck {
        reason_code: ReasonCode,
    },
    Publish {
        topic: Topic,
        content: String,
        fence: Geofence,
    },
    PubAck {
        reason_code: ReasonCode,
    },
    /// 位置上报
    PingReq {
        location: Location,
    },
    PingResp {
        reason_code: ReasonCode,
    },
}

impl Payload {
    /// 向缓冲区写入一帧
    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        let body = serde_json::to_vec(self)?;
        if body.len() > PAYLOAD_MAX_LENGTH {
            return Err(Error::PayloadTooLarge);
        }

        stream.put_u32(body.len() as u32);
        stream.put_slice(&body);
        Ok(())
    }

    /// 从缓冲区读出一帧
    /// 数据不足时返回 InsufficientBytes，由网络层补足后重试
    pub fn read_from(stream: &mut BytesMut) -> Result<Payload, Error> {
        if stream.len() < 4 {
            return Err(Error::InsufficientBytes(4 - stream.len()));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&stream[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > PAYLOAD_MAX_LENGTH {
            return Err(Error::PayloadTooLarge);
        }

        if stream.len() < 4 + len {
            return Err(Error::InsufficientBytes(4 + len - stream.len()));
        }

        stream.advance(4);
        let body = stream.split_to(len);
        Ok(serde_json::from_slice(&body)?)
    }
}
