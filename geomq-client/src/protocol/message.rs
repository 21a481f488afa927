use crate::network::payload::Payload;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Topic '{0}' is not under the functions namespace")]
    NotAFunctionTopic(String),
    #[error("Expected a publish payload")]
    NotAPublish,
    #[error("Malformed function message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// 函数消息的动作，与主题的最后一层对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FunctionAction {
    Call,
    Result,
    Ack,
    Nack,
}

/// 消息类型标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TypeCode {
    Normal,
    /// 应答中捎带了函数结果
    Piggy,
}

/// 从 PUBLISH 内容解码出的应用层消息
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionMessage {
    pub func_name: String,
    pub func_action: FunctionAction,
    pub data: String,
    pub type_code: TypeCode,
}

impl FunctionMessage {
    pub fn new(
        func_name: impl Into<String>,
        func_action: FunctionAction,
        data: impl Into<String>,
        type_code: TypeCode,
    ) -> Self {
        Self {
            func_name: func_name.into(),
            func_action,
            data: data.into(),
            type_code,
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// 只接受 functions/ 命名空间下的 PUBLISH，其余一律拒绝
    pub fn from_publish(payload: &Payload) -> Result<FunctionMessage, Error> {
        match payload {
            Payload::Publish { topic, content, .. } => {
                if topic.first_level() != "functions" {
                    return Err(Error::NotAFunctionTopic(topic.to_string()));
                }

                Ok(serde_json::from_str(content)?)
            }
            _ => Err(Error::NotAPublish),
        }
    }
}
