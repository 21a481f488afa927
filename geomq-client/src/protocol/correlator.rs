use std::collections::VecDeque;

use crate::network::payload::{Payload, ReasonCode};

/// 对一次 publish 确认的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 成功送达
    Success,
    /// 按成功处理，但需要向调用方告警（如本地无订阅者但已转发）
    SuccessWithWarning,
    Failure,
}

/// 应答归并器
/// broker 在同一个应答流上混发函数消息与协议确认，
/// 错位到达的应答先进各自的 FIFO，由之后监听对应类型的调用取走。
/// 两个队列都先于任何新的网络读被清空，
/// 保证没有应答被读两次，同类应答保持到达顺序
#[derive(Debug, Default)]
pub struct Correlator {
    /// 等待函数监听路径取走的 PUBLISH
    pub_queue: VecDeque<Payload>,
    /// 等待确认监听路径取走的协议应答
    ack_queue: VecDeque<Payload>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop_publish(&mut self) -> Option<Payload> {
        self.pub_queue.pop_front()
    }

    pub fn push_publish(&mut self, payload: Payload) {
        self.pub_queue.push_back(payload);
    }

    pub fn pop_ack(&mut self) -> Option<Payload> {
        self.ack_queue.pop_front()
    }

    pub fn push_ack(&mut self, payload: Payload) {
        self.ack_queue.push_back(payload);
    }

    pub fn pub_backlog(&self) -> usize {
        self.pub_queue.len()
    }

    pub fn ack_backlog(&self) -> usize {
        self.ack_queue.len()
    }

    /// 按结果码判定 publish 确认
    pub fn classify_pub_ack(reason_code: ReasonCode) -> AckOutcome {
        match reason_code {
            ReasonCode::GrantedQoS0 | ReasonCode::Success => AckOutcome::Success,
            ReasonCode::NoMatchingSubscribersButForwarded => AckOutcome::SuccessWithWarning,
            ReasonCode::NoMatchingSubscribers => AckOutcome::Failure,
            ReasonCode::NotConnectedOrNoLocation => AckOutcome::Failure,
            // 其余结果码宽松处理：告警但视为成功
            _ => AckOutcome::SuccessWithWarning,
        }
    }
}
