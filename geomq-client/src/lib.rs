//! 地理分布式 pub/sub broker 的客户端会话层
//! 维护与某个 broker 的连接、地理围栏订阅与应答归并，
//! 客户端位置移出当前 broker 的辖区时透明迁移会话

use async_trait::async_trait;

use network::payload::BrokerInfo;

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

/// 会话生命周期事件的回调，由用户实现
/// 核心逻辑只发事件，不依赖回调的结果
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 握手完成，会话建立
    async fn connected(&self, broker: &BrokerInfo);
    /// broker 迁移完成
    async fn migrated(&self, from: &BrokerInfo, to: &BrokerInfo);
    /// 会话终止
    async fn disconnected(&self, broker: &BrokerInfo);
}

pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn connected(&self, _broker: &BrokerInfo) {}
    async fn migrated(&self, _from: &BrokerInfo, _to: &BrokerInfo) {}
    async fn disconnected(&self, _broker: &BrokerInfo) {}
}
