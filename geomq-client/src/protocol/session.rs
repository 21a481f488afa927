use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};

use crate::{
    config::Config,
    error::Error,
    network::{
        payload::{BrokerInfo, Geofence, Location, Payload, ReasonCode, Topic},
        Connector, Transport,
    },
    Hook, HookNoop,
};

use super::{
    correlator::{AckOutcome, Correlator},
    message::FunctionMessage,
    registry::{function_topics, ListeningTopic, SubscriptionRegistry},
    ClientType, StatusCode,
};

/// 会话所处的阶段
/// Disconnected 与 Connecting 被构造过程覆盖：
/// establish 内部经历这两个阶段，成功返回的会话即为 Connected，
/// 调用方只会观察到后三个状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Migrating,
    Terminated,
}

/// 握手应答的判定
enum ConnVerdict {
    /// broker 接受了连接
    Accepted,
    /// broker 拒绝，但给出了建议改连的 broker
    TryAnother(BrokerInfo, ReasonCode),
}

/// 客户端与 geo broker 集群之间的一次会话
/// 只持有一个活跃的 Transport；迁移时先验证新连接再替换，
/// 调用方永远观察不到半迁移状态
pub struct Session<C: Connector, H: Hook = HookNoop> {
    /// 客户端 id
    pub client_id: String,
    mode: ClientType,
    /// 客户端当前位置，只在位置上报被确认后更新
    location: Location,
    /// 当前连接的 broker
    broker: BrokerInfo,
    state: SessionState,
    transport: C::Transport,
    connector: C,
    registry: SubscriptionRegistry,
    correlator: Correlator,
    hook: Arc<H>,
    connect_timeout: Duration,
    teardown_wait: Duration,
}

impl<C: Connector> Session<C> {
    /// 连接配置的 broker 并完成握手
    pub async fn establish(cfg: Config, location: Location, connector: C) -> Result<Self, Error> {
        Self::establish_with_hook(cfg, location, connector, Arc::new(HookNoop)).await
    }
}

impl<C: Connector, H: Hook> Session<C, H> {
    /// 连接配置的 broker 并完成握手
    /// broker 拒绝但给出建议时，向建议的 broker 重发一次 CONNECT；
    /// 第二次失败即为致命
    pub async fn establish_with_hook(
        cfg: Config,
        location: Location,
        connector: C,
        hook: Arc<H>,
    ) -> Result<Self, Error> {
        let broker = cfg.broker_info();
        let connect_timeout = Duration::from_millis(cfg.session.connect_timeout_ms);
        let teardown_wait = Duration::from_millis(cfg.session.teardown_wait_ms);

        debug!("connecting to broker {}...", broker);
        let mut transport = connector.open(&broker.host, broker.port).await?;
        transport
            .send(Payload::Connect {
                client_id: cfg.session.client_id.clone(),
                location,
            })
            .await?;
        let conn_ack = transport.receive_timeout(connect_timeout).await?;

        let (transport, broker) = match Self::check_conn_ack(&conn_ack, &broker)? {
            ConnVerdict::Accepted => (transport, broker),
            ConnVerdict::TryAnother(suggested, _) => {
                warn!("changed the remote broker to the suggested: {}", suggested);
                transport.tear_down(teardown_wait).await;

                let mut next = connector.open(&suggested.host, suggested.port).await?;
                next.send(Payload::Connect {
                    client_id: cfg.session.client_id.clone(),
                    location,
                })
                .await?;
                let conn_ack = next.receive_timeout(connect_timeout).await?;
                match Self::check_conn_ack(&conn_ack, &suggested)? {
                    ConnVerdict::Accepted => (next, suggested),
                    // 不再跟随第二个建议
                    ConnVerdict::TryAnother(_, reason) => {
                        return Err(Error::ConnectionRefused {
                            broker: suggested,
                            reason,
                        })
                    }
                }
            }
        };

        info!("'{}' connected to broker {}", cfg.session.client_id, broker);
        hook.connected(&broker).await;

        Ok(Self {
            client_id: cfg.session.client_id,
            mode: cfg.session.mode,
            location,
            broker,
            state: SessionState::Connected,
            transport,
            connector,
            registry: SubscriptionRegistry::new(),
            correlator: Correlator::new(),
            hook,
            connect_timeout,
            teardown_wait,
        })
    }

    fn check_conn_ack(
        conn_ack: &Option<Payload>,
        broker: &BrokerInfo,
    ) -> Result<ConnVerdict, Error> {
        match conn_ack {
            Some(Payload::ConnAck {
                reason_code: ReasonCode::Success,
            }) => Ok(ConnVerdict::Accepted),
            Some(Payload::Disconnect {
                reason_code,
                broker_info,
            }) => match (reason_code, broker_info) {
                (ReasonCode::ProtocolError, _) => {
                    error!(
                        "{:?}! duplicate client id? can't connect to the broker {}",
                        reason_code, broker
                    );
                    Err(Error::ConnectionRefused {
                        broker: broker.clone(),
                        reason: *reason_code,
                    })
                }
                (ReasonCode::WrongBroker, _) => {
                    error!("{:?}! no broker is responsible for this client", reason_code);
                    Err(Error::NoResponsibleBroker)
                }
                (_, Some(suggested)) => {
                    Ok(ConnVerdict::TryAnother(suggested.clone(), *reason_code))
                }
                (_, None) => {
                    error!(
                        "{:?}! can't connect to the broker {}, no alternative suggested",
                        reason_code, broker
                    );
                    Err(Error::ConnectionRefused {
                        broker: broker.clone(),
                        reason: *reason_code,
                    })
                }
            },
            None => Err(Error::ConnectTimeout(broker.clone())),
            Some(other) => {
                error!("unexpected conn ack: {:?}", other);
                Err(Error::UnexpectedReply("connecting"))
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn broker(&self) -> &BrokerInfo {
        &self.broker
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// 订阅一个函数的监听主题（按角色展开）
    /// 返回本次新增的 (topic, fence)；主主题被 broker 拒绝时返回 None，
    /// 已存在的主题直接跳过，不发起网络往返，围栏保持原样
    pub async fn subscribe_function(
        &mut self,
        func_name: &str,
        fence: &Geofence,
    ) -> Result<Option<Vec<ListeningTopic>>, Error> {
        debug!("subscribe_function() call. func: '{}'", func_name);
        let mut new_topics = Vec::new();

        for (i, topic) in function_topics(self.mode, func_name).into_iter().enumerate() {
            match self.subscribe(&topic, fence).await? {
                StatusCode::Success => new_topics.push(ListeningTopic {
                    topic,
                    fence: fence.clone(),
                }),
                // 主主题被拒绝，放弃其余子主题
                StatusCode::Failure if i == 0 => return Ok(None),
                _ => {}
            }
        }

        if new_topics.is_empty() {
            debug!("listening topics didn't change, nothing subscribed new");
        } else {
            for entry in &new_topics {
                self.registry.insert(entry.clone());
            }
            debug!(
                "listening topics appended by {}, now {}",
                new_topics.len(),
                self.registry.len()
            );
        }

        Ok(Some(new_topics))
    }

    async fn subscribe(&mut self, topic: &Topic, fence: &Geofence) -> Result<StatusCode, Error> {
        if self.registry.contains(topic) {
            warn!("already subscribed to '{}'", topic);
            return Ok(StatusCode::AlreadyExist);
        }

        self.transport
            .send(Payload::Subscribe {
                topic: topic.clone(),
                fence: fence.clone(),
            })
            .await?;
        let sub_ack = self.transport.receive_timeout(self.connect_timeout).await?;

        match sub_ack {
            Some(Payload::SubAck {
                reason_code: ReasonCode::GrantedQoS0,
            }) => {
                info!("'{}' subscribed to '{}'", self.client_id, topic);
                Ok(StatusCode::Success)
            }
            Some(Payload::SubAck { reason_code }) => {
                error!("subscribing to '{}' rejected: {:?}", topic, reason_code);
                Ok(StatusCode::Failure)
            }
            other => {
                error!("expected a SubAck, got: {:?}", other);
                Ok(StatusCode::Failure)
            }
        }
    }

    /// 退订一个函数的监听主题
    /// 与订阅不同，某个子主题失败或不存在不影响其余子主题（尽力而为）
    pub async fn unsubscribe_function(&mut self, func_name: &str) -> Result<Vec<Topic>, Error> {
        debug!("unsubscribe_function() call. func: '{}'", func_name);
        let mut removed = Vec::new();

        for topic in function_topics(self.mode, func_name) {
            if self.unsubscribe(&topic).await? == StatusCode::Success {
                removed.push(topic);
            }
        }

        if removed.is_empty() {
            debug!("listening topics didn't change, nothing unsubscribed");
        } else {
            for topic in &removed {
                self.registry.remove(topic);
            }
            debug!(
                "listening topics decreased by {}, now {}",
                removed.len(),
                self.registry.len()
            );
        }

        Ok(removed)
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<StatusCode, Error> {
        if !self.registry.contains(topic) {
            warn!("subscription '{}' doesn't exist", topic);
            return Ok(StatusCode::NotExist);
        }

        self.transport
            .send(Payload::Unsubscribe {
                topic: topic.clone(),
            })
            .await?;
        let unsub_ack = self.transport.receive_timeout(self.connect_timeout).await?;

        match unsub_ack {
            Some(Payload::UnsubAck {
                reason_code: ReasonCode::Success,
            }) => {
                info!("'{}' unsubscribed from '{}'", self.client_id, topic);
                Ok(StatusCode::Success)
            }
            Some(Payload::UnsubAck { reason_code }) => {
                error!("unsubscribing from '{}' rejected: {:?}", topic, reason_code);
                Ok(StatusCode::Failure)
            }
            other => {
                error!("expected an UnsubAck, got: {:?}", other);
                Ok(StatusCode::Failure)
            }
        }
    }

    /// 各函数正在监听的动作后缀，按函数名分组
    pub fn subscribed_functions_list(&self) -> std::collections::HashMap<String, Vec<String>> {
        self.registry.subscribed_functions()
    }

    /// 发布一条函数消息
    /// broker 的确认经由 listen_for_pub_ack 的路径消费
    pub async fn publish(
        &mut self,
        topic: &Topic,
        message: &FunctionMessage,
        fence: &Geofence,
    ) -> Result<(), Error> {
        let content = message.encode()?;
        self.transport
            .send(Payload::Publish {
                topic: topic.clone(),
                content,
                fence: fence.clone(),
            })
            .await?;
        Ok(())
    }

    /// 监听一条函数消息（call/result/ack/nack）
    /// 先清先前错位入队的 PUBLISH，队列为空才读网络；
    /// 等到的不是 PUBLISH 时转入 ack 队列并返回 None。
    /// timeout 为零表示一直阻塞
    pub async fn listen_for_function(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<FunctionMessage>, Error> {
        let msg = match self.correlator.pop_publish() {
            Some(enqueued) => {
                debug!(
                    "pub queue backlog {}, dequeued: {:?}",
                    self.correlator.pub_backlog(),
                    enqueued
                );
                enqueued
            }
            None => {
                info!("listening to broker {} for a function message...", self.broker);
                let received = if timeout.is_zero() {
                    Some(self.transport.receive().await?)
                } else {
                    self.transport.receive_timeout(timeout).await?
                };

                match received {
                    Some(payload) => {
                        debug!("event from broker: {:?}", payload);
                        payload
                    }
                    None => {
                        error!("listening timeout ({:?})", timeout);
                        return Ok(None);
                    }
                }
            }
        };

        match msg {
            Payload::Publish { .. } => match FunctionMessage::from_publish(&msg) {
                Ok(message) => Ok(Some(message)),
                Err(e) => {
                    error!("{}", e);
                    Ok(None)
                }
            },
            other => {
                warn!("not a publish, queued for the ack path: {:?}", other);
                self.correlator.push_ack(other);
                Ok(None)
            }
        }
    }

    /// 监听一条 publish 确认并判定结果
    /// 等到的是 PUBLISH 时转入 pub 队列并返回 Retry，
    /// 由之后的 listen_for_function 调用取走
    pub async fn listen_for_pub_ack(&mut self, timeout: Duration) -> Result<StatusCode, Error> {
        match self.correlator.pop_ack() {
            Some(enqueued) => {
                debug!(
                    "ack queue backlog {}, dequeued: {:?}",
                    self.correlator.ack_backlog(),
                    enqueued
                );
                match enqueued {
                    ack @ Payload::PubAck { .. } => {
                        Ok(self.process_pub_ack(Some(ack), !timeout.is_zero()))
                    }
                    other => {
                        error!("expected a PubAck in the ack queue, dismissed: {:?}", other);
                        Ok(StatusCode::Retry)
                    }
                }
            }
            None => {
                debug!("ack queue empty, listening for a PubAck...");
                let pub_ack = self.transport.receive_timeout(timeout).await?;
                Ok(self.process_pub_ack(pub_ack, !timeout.is_zero()))
            }
        }
    }

    fn process_pub_ack(&mut self, pub_ack: Option<Payload>, with_timeout: bool) -> StatusCode {
        match pub_ack {
            Some(Payload::PubAck { reason_code }) => {
                match Correlator::classify_pub_ack(reason_code) {
                    AckOutcome::Success => {
                        info!("publish acknowledged: {:?}", reason_code);
                        StatusCode::Success
                    }
                    AckOutcome::SuccessWithWarning => {
                        warn!("publish acknowledged with {:?}", reason_code);
                        StatusCode::Success
                    }
                    AckOutcome::Failure => {
                        error!("{:?}! publish rejected", reason_code);
                        StatusCode::Failure
                    }
                }
            }
            Some(publish @ Payload::Publish { .. }) => {
                warn!("not a PubAck, queued for the function path: {:?}", publish);
                self.correlator.push_publish(publish);
                StatusCode::Retry
            }
            None if with_timeout => {
                error!("timeout, no publish ack received");
                StatusCode::Failure
            }
            other => {
                error!("unexpected publish ack: {:?}", other);
                StatusCode::Failure
            }
        }
    }

    /// 向 broker 上报新位置
    /// broker 以 WrongBroker 拒绝并附带建议时触发迁移；
    /// 等待应答超时返回可恢复的 Failure（旧连接名义上仍可用）。
    /// 迁移成功后已有订阅不会自动在新 broker 上重建，需要调用方重新订阅
    pub async fn update_location(&mut self, new_loc: Location) -> Result<StatusCode, Error> {
        self.transport
            .send(Payload::PingReq { location: new_loc })
            .await?;
        let ping_ack = self.transport.receive_timeout(self.connect_timeout).await?;
        debug!("ping ack: {:?}", ping_ack);

        match ping_ack {
            Some(Payload::PingResp {
                reason_code: ReasonCode::LocationUpdated,
            }) => {
                self.location = new_loc;
                info!("location updated to {:?}", self.location);
                Ok(StatusCode::Success)
            }
            Some(Payload::PingResp { reason_code }) => {
                error!("unexpected reason code: {:?}", reason_code);
                Err(Error::UnexpectedReply("updating the location"))
            }
            Some(Payload::Disconnect {
                reason_code: ReasonCode::WrongBroker,
                broker_info,
            }) => {
                warn!("moved outside of the current broker's area");
                // 旧 broker 已不再负责此位置，本地位置先行提交
                self.location = new_loc;

                match broker_info {
                    Some(suggested) => {
                        self.state = SessionState::Migrating;
                        if self.change_broker(suggested.clone()).await? == StatusCode::Success {
                            info!("location updated to {:?}", self.location);
                            Ok(StatusCode::Success)
                        } else {
                            error!(
                                "failed to change the broker, and the previous broker is no longer responsible"
                            );
                            self.state = SessionState::Connected;
                            Err(Error::MigrationFailed(suggested))
                        }
                    }
                    None => {
                        error!("no broker is responsible for the current location");
                        Err(Error::NoResponsibleBroker)
                    }
                }
            }
            Some(Payload::Disconnect { reason_code, .. }) => {
                error!("unexpected reason code: {:?}", reason_code);
                Err(Error::UnexpectedReply("updating the location"))
            }
            None => {
                error!(
                    "updating location failed, no response from broker {}",
                    self.broker
                );
                Ok(StatusCode::Failure)
            }
            Some(other) => {
                error!("unexpected ack while updating the location: {:?}", other);
                Err(Error::UnexpectedReply("updating the location"))
            }
        }
    }

    /// 迁移到建议的 broker
    /// 新连接握手成功后才替换为活跃连接，再拆除旧连接；
    /// 失败时丢弃新连接，旧连接保持不变
    async fn change_broker(&mut self, broker: BrokerInfo) -> Result<StatusCode, Error> {
        warn!("changing the remote broker to {}...", broker);

        let mut next = match self.connector.open(&broker.host, broker.port).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("failed to reach the suggested broker {}: {}", broker, e);
                return Ok(StatusCode::Failure);
            }
        };

        if let Err(e) = next
            .send(Payload::Connect {
                client_id: self.client_id.clone(),
                location: self.location,
            })
            .await
        {
            error!("failed to change the remote broker to {}: {}", broker, e);
            next.tear_down(self.teardown_wait).await;
            return Ok(StatusCode::Failure);
        }

        match next.receive_timeout(self.connect_timeout).await {
            Ok(Some(Payload::ConnAck {
                reason_code: ReasonCode::Success,
            })) => {
                let mut previous = std::mem::replace(&mut self.transport, next);
                let old_broker = std::mem::replace(&mut self.broker, broker);
                self.state = SessionState::Connected;
                info!("switched the remote broker to: {}", self.broker.broker_id);

                previous.tear_down(self.teardown_wait).await;
                info!("disconnected from the previous broker");
                self.hook.migrated(&old_broker, &self.broker).await;
                Ok(StatusCode::Success)
            }
            Ok(other) => {
                error!(
                    "failed to change the remote broker to {}, reply: {:?}",
                    broker, other
                );
                next.tear_down(self.teardown_wait).await;
                Ok(StatusCode::Failure)
            }
            Err(e) => {
                error!("failed to change the remote broker to {}: {}", broker, e);
                next.tear_down(self.teardown_wait).await;
                Ok(StatusCode::Failure)
            }
        }
    }

    /// 优雅终止会话：尽力通知 broker，然后有界拆除传输
    /// 即使后台任务未在期限内退出也会正常返回，只记录完整性告警
    pub async fn terminate(mut self) {
        self.state = SessionState::Terminated;

        if let Err(e) = self
            .transport
            .send(Payload::Disconnect {
                reason_code: ReasonCode::NormalDisconnection,
                broker_info: None,
            })
            .await
        {
            // 尽力而为，不重试
            warn!("disconnect notice failed: {}", e);
        }

        if self.transport.tear_down(self.teardown_wait).await {
            info!("session channel shut down properly");
        } else {
            error!(
                "transport workers still running after {:?}",
                self.teardown_wait
            );
        }

        self.hook.disconnected(&self.broker).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;

    use crate::{
        config::Config,
        network::{self, payload::Geofence},
        protocol::message::{FunctionAction, TypeCode},
    };

    use super::*;

    /// 预编排应答的内存传输，记录发出的每个请求
    /// 脚本耗尽后再读网络视为测试失败
    struct MockTransport {
        replies: VecDeque<Option<Payload>>,
        sent: Arc<Mutex<Vec<Payload>>>,
        torn_down: Arc<Mutex<bool>>,
        workers_exit: bool,
    }

    impl MockTransport {
        fn scripted(replies: Vec<Option<Payload>>) -> Self {
            Self {
                replies: VecDeque::from(replies),
                sent: Arc::new(Mutex::new(Vec::new())),
                torn_down: Arc::new(Mutex::new(false)),
                workers_exit: true,
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, payload: Payload) -> Result<(), network::Error> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Payload, network::Error> {
            match self.replies.pop_front() {
                Some(Some(payload)) => Ok(payload),
                _ => Err(network::Error::ConnectionAborted),
            }
        }

        async fn receive_timeout(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<Payload>, network::Error> {
            match self.replies.pop_front() {
                Some(reply) => Ok(reply),
                None => Err(network::Error::ConnectionAborted),
            }
        }

        async fn tear_down(&mut self, _wait: Duration) -> bool {
            *self.torn_down.lock().unwrap() = true;
            self.workers_exit
        }
    }

    /// 每次 open 取出下一个预设的传输
    struct MockConnector {
        transports: Mutex<VecDeque<MockTransport>>,
        opened: Arc<Mutex<Vec<(String, u16)>>>,
    }

    impl MockConnector {
        fn new(transports: Vec<MockTransport>) -> Self {
            Self {
                transports: Mutex::new(VecDeque::from(transports)),
                opened: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn open(&self, host: &str, port: u16) -> Result<MockTransport, network::Error> {
            self.opened.lock().unwrap().push((host.to_owned(), port));
            self.transports
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(network::Error::ConnectionAborted)
        }
    }

    fn test_config(mode: &str) -> Config {
        toml::from_str(&format!(
            r#"
            [broker]
            host = "localhost"

            [session]
            client_id = "client1"
            mode = "{}"
            "#,
            mode
        ))
        .unwrap()
    }

    fn fence(radius: f64) -> Geofence {
        Geofence::Circle {
            center: Location::new(0.0, 0.0),
            radius,
        }
    }

    fn conn_ack() -> Option<Payload> {
        Some(Payload::ConnAck {
            reason_code: ReasonCode::Success,
        })
    }

    fn sub_ack(reason_code: ReasonCode) -> Option<Payload> {
        Some(Payload::SubAck { reason_code })
    }

    fn broker_b() -> BrokerInfo {
        BrokerInfo {
            broker_id: "frankfurt".to_owned(),
            host: "frankfurt.example".to_owned(),
            port: 5559,
        }
    }

    fn function_publish(topic: &str, message: &FunctionMessage) -> Option<Payload> {
        Some(Payload::Publish {
            topic: Topic::new(topic),
            content: message.encode().unwrap(),
            fence: fence(2.0),
        })
    }

    /// 已连接的会话：第一条脚本应答固定为成功的 CONNACK
    async fn connected_session(
        mode: &str,
        mut replies: Vec<Option<Payload>>,
    ) -> (
        Session<MockConnector>,
        Arc<Mutex<Vec<Payload>>>,
        Arc<Mutex<bool>>,
    ) {
        replies.insert(0, conn_ack());
        let transport = MockTransport::scripted(replies);
        let sent = transport.sent.clone();
        let torn_down = transport.torn_down.clone();
        let connector = MockConnector::new(vec![transport]);

        let session = Session::establish(test_config(mode), Location::new(1.0, 1.0), connector)
            .await
            .unwrap();
        (session, sent, torn_down)
    }

    #[tokio::test]
    async fn establish_handshake_success() {
        let (session, sent, _) = connected_session("client", vec![]).await;

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.location(), Location::new(1.0, 1.0));
        // 握手报文携带客户端 id，broker 才能辨识并拒绝重复的 id
        assert_eq!(
            *sent.lock().unwrap(),
            vec![Payload::Connect {
                client_id: "client1".to_owned(),
                location: Location::new(1.0, 1.0)
            }]
        );
    }

    #[tokio::test]
    async fn establish_follows_suggested_broker_once() {
        let refused = MockTransport::scripted(vec![Some(Payload::Disconnect {
            reason_code: ReasonCode::NotConnectedOrNoLocation,
            broker_info: Some(broker_b()),
        })]);
        let refused_torn_down = refused.torn_down.clone();
        let accepted = MockTransport::scripted(vec![conn_ack()]);
        let connector = MockConnector::new(vec![refused, accepted]);
        let opened = connector.opened.clone();

        let session = Session::establish(test_config("client"), Location::new(1.0, 1.0), connector)
            .await
            .unwrap();

        assert_eq!(session.broker(), &broker_b());
        assert_eq!(
            *opened.lock().unwrap(),
            vec![
                ("localhost".to_owned(), 5559),
                ("frankfurt.example".to_owned(), 5559)
            ]
        );
        // 被拒绝的连接已被拆除
        assert!(*refused_torn_down.lock().unwrap());
    }

    #[tokio::test]
    async fn establish_fatal_outcomes() {
        // ProtocolError：重复的客户端 id，即使附带建议也不重试
        let transport = MockTransport::scripted(vec![Some(Payload::Disconnect {
            reason_code: ReasonCode::ProtocolError,
            broker_info: Some(broker_b()),
        })]);
        let result = Session::establish(
            test_config("client"),
            Location::new(1.0, 1.0),
            MockConnector::new(vec![transport]),
        )
        .await;
        assert!(matches!(result, Err(Error::ConnectionRefused { .. })));

        // 超时：broker 不可达
        let transport = MockTransport::scripted(vec![None]);
        let result = Session::establish(
            test_config("client"),
            Location::new(1.0, 1.0),
            MockConnector::new(vec![transport]),
        )
        .await;
        assert!(matches!(result, Err(Error::ConnectTimeout(_))));

        // 其它报文形态：协议违例
        let transport = MockTransport::scripted(vec![sub_ack(ReasonCode::GrantedQoS0)]);
        let result = Session::establish(
            test_config("client"),
            Location::new(1.0, 1.0),
            MockConnector::new(vec![transport]),
        )
        .await;
        assert!(matches!(result, Err(Error::UnexpectedReply(_))));
    }

    #[tokio::test]
    async fn client_subscribe_expands_to_result_and_ack() {
        let (mut session, sent, _) = connected_session(
            "client",
            vec![
                sub_ack(ReasonCode::GrantedQoS0),
                sub_ack(ReasonCode::GrantedQoS0),
            ],
        )
        .await;

        let added = session
            .subscribe_function("f1", &fence(2.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(session.subscriptions().len(), 2);
        assert!(session
            .subscriptions()
            .contains(&Topic::new("functions/f1/result")));
        assert!(session
            .subscriptions()
            .contains(&Topic::new("functions/f1/ack")));

        let sent = sent.lock().unwrap();
        assert!(matches!(
            &sent[1],
            Payload::Subscribe { topic, .. } if topic.0 == "functions/f1/result"
        ));
        assert!(matches!(
            &sent[2],
            Payload::Subscribe { topic, .. } if topic.0 == "functions/f1/ack"
        ));
    }

    #[tokio::test]
    async fn duplicate_subscribe_short_circuits() {
        let (mut session, sent, _) = connected_session(
            "client",
            vec![
                sub_ack(ReasonCode::GrantedQoS0),
                sub_ack(ReasonCode::GrantedQoS0),
            ],
        )
        .await;

        session.subscribe_function("f1", &fence(2.0)).await.unwrap();
        let wire_calls = sent.lock().unwrap().len();

        // 换一个围栏重复订阅：不发起网络往返，围栏保持原样
        let added = session
            .subscribe_function("f1", &fence(9.0))
            .await
            .unwrap()
            .unwrap();
        assert!(added.is_empty());
        assert_eq!(session.subscriptions().len(), 2);
        assert_eq!(
            session
                .subscriptions()
                .fence(&Topic::new("functions/f1/result")),
            Some(&fence(2.0))
        );
        assert_eq!(sent.lock().unwrap().len(), wire_calls);
    }

    #[tokio::test]
    async fn rejected_primary_topic_aborts_subscribe() {
        let (mut session, _, _) = connected_session(
            "client",
            vec![sub_ack(ReasonCode::NotConnectedOrNoLocation)],
        )
        .await;

        let result = session.subscribe_function("f1", &fence(2.0)).await.unwrap();
        assert!(result.is_none());
        assert!(session.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_returns_nothing() {
        let (mut session, sent, _) = connected_session("client", vec![]).await;

        let removed = session.unsubscribe_function("f1").await.unwrap();
        assert!(removed.is_empty());
        // 只有建连的 CONNECT 上过网络
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_best_effort_per_topic() {
        let (mut session, _, _) = connected_session(
            "client",
            vec![
                sub_ack(ReasonCode::GrantedQoS0),
                sub_ack(ReasonCode::GrantedQoS0),
                // result 的退订被拒绝，ack 的退订仍然尝试并成功
                Some(Payload::UnsubAck {
                    reason_code: ReasonCode::NoSubscriptionExisted,
                }),
                Some(Payload::UnsubAck {
                    reason_code: ReasonCode::Success,
                }),
            ],
        )
        .await;

        session.subscribe_function("f1", &fence(2.0)).await.unwrap();
        let removed = session.unsubscribe_function("f1").await.unwrap();

        assert_eq!(removed, vec![Topic::new("functions/f1/ack")]);
        assert_eq!(session.subscriptions().len(), 1);
        assert!(session
            .subscriptions()
            .contains(&Topic::new("functions/f1/result")));
    }

    #[tokio::test]
    async fn misrouted_publish_rendezvous() {
        let message =
            FunctionMessage::new("f1", FunctionAction::Result, "42", TypeCode::Normal);
        let (mut session, _, _) = connected_session(
            "client",
            vec![function_publish("functions/f1/result", &message)],
        )
        .await;

        // 等确认时等到了 PUBLISH：入队并要求重试
        let status = session
            .listen_for_pub_ack(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::Retry);

        // 后续的函数监听从队列取走，不再读网络（脚本已耗尽，再读会报错）
        let received = session
            .listen_for_function(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(received, Some(message));
    }

    #[tokio::test]
    async fn misrouted_ack_rendezvous() {
        let (mut session, _, _) = connected_session(
            "client",
            vec![Some(Payload::PubAck {
                reason_code: ReasonCode::GrantedQoS0,
            })],
        )
        .await;

        // 等函数消息时等到了确认：入队，本次无果
        let received = session
            .listen_for_function(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(received.is_none());

        // 确认监听从队列取走并判定成功
        let status = session
            .listen_for_pub_ack(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::Success);
    }

    #[tokio::test]
    async fn pub_ack_outcomes() {
        let (mut session, _, _) = connected_session(
            "client",
            vec![
                Some(Payload::PubAck {
                    reason_code: ReasonCode::NoMatchingSubscribers,
                }),
                Some(Payload::PubAck {
                    reason_code: ReasonCode::NoMatchingSubscribersButForwarded,
                }),
                None,
            ],
        )
        .await;

        assert_eq!(
            session
                .listen_for_pub_ack(Duration::from_millis(100))
                .await
                .unwrap(),
            StatusCode::Failure
        );
        // 已转发按成功处理
        assert_eq!(
            session
                .listen_for_pub_ack(Duration::from_millis(100))
                .await
                .unwrap(),
            StatusCode::Success
        );
        // 超时
        assert_eq!(
            session
                .listen_for_pub_ack(Duration::from_millis(100))
                .await
                .unwrap(),
            StatusCode::Failure
        );
    }

    #[tokio::test]
    async fn listen_for_function_timeout_is_recoverable() {
        let (mut session, _, _) = connected_session("client", vec![None]).await;

        // 限时监听超时不是致命错误，返回空结果
        let received = session
            .listen_for_function(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(received.is_none());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn foreign_namespace_publish_discarded() {
        let message = FunctionMessage::new("f1", FunctionAction::Call, "x", TypeCode::Normal);
        let (mut session, _, _) = connected_session(
            "client",
            vec![function_publish("sensors/t1/report", &message)],
        )
        .await;

        let received = session
            .listen_for_function(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn location_update_success_commits() {
        let (mut session, _, _) = connected_session(
            "client",
            vec![Some(Payload::PingResp {
                reason_code: ReasonCode::LocationUpdated,
            })],
        )
        .await;

        let status = session.update_location(Location::new(2.0, 3.0)).await.unwrap();
        assert_eq!(status, StatusCode::Success);
        assert_eq!(session.location(), Location::new(2.0, 3.0));
    }

    #[tokio::test]
    async fn location_update_timeout_is_recoverable() {
        let (mut session, _, _) = connected_session("client", vec![None]).await;

        let status = session.update_location(Location::new(2.0, 3.0)).await.unwrap();
        assert_eq!(status, StatusCode::Failure);
        // 未确认，本地位置不动
        assert_eq!(session.location(), Location::new(1.0, 1.0));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn migration_adopts_new_broker() {
        let old = MockTransport::scripted(vec![
            conn_ack(),
            Some(Payload::Disconnect {
                reason_code: ReasonCode::WrongBroker,
                broker_info: Some(broker_b()),
            }),
        ]);
        let old_torn_down = old.torn_down.clone();
        let next = MockTransport::scripted(vec![conn_ack()]);
        let next_sent = next.sent.clone();
        let connector = MockConnector::new(vec![old, next]);

        let mut session =
            Session::establish(test_config("client"), Location::new(1.0, 1.0), connector)
                .await
                .unwrap();

        let status = session.update_location(Location::new(9.0, 9.0)).await.unwrap();
        assert_eq!(status, StatusCode::Success);
        assert_eq!(session.broker(), &broker_b());
        assert_eq!(session.location(), Location::new(9.0, 9.0));
        assert_eq!(session.state(), SessionState::Connected);
        // 新连接上以同一个客户端 id 重放了 CONNECT，旧连接已拆除
        assert_eq!(
            *next_sent.lock().unwrap(),
            vec![Payload::Connect {
                client_id: "client1".to_owned(),
                location: Location::new(9.0, 9.0)
            }]
        );
        assert!(*old_torn_down.lock().unwrap());
    }

    #[tokio::test]
    async fn failed_migration_keeps_previous_broker() {
        let old = MockTransport::scripted(vec![
            conn_ack(),
            Some(Payload::Disconnect {
                reason_code: ReasonCode::WrongBroker,
                broker_info: Some(broker_b()),
            }),
        ]);
        let old_torn_down = old.torn_down.clone();
        // 新 broker 的握手超时
        let next = MockTransport::scripted(vec![None]);
        let connector = MockConnector::new(vec![old, next]);

        let mut session =
            Session::establish(test_config("client"), Location::new(1.0, 1.0), connector)
                .await
                .unwrap();
        let original_broker = session.broker().clone();

        let result = session.update_location(Location::new(9.0, 9.0)).await;
        assert!(matches!(result, Err(Error::MigrationFailed(_))));
        // 旧连接保持活跃；本地位置已按约定先行提交
        assert_eq!(session.broker(), &original_broker);
        assert_eq!(session.location(), Location::new(9.0, 9.0));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!*old_torn_down.lock().unwrap());
    }

    #[tokio::test]
    async fn wrong_broker_without_suggestion_is_fatal() {
        let (mut session, _, _) = connected_session(
            "client",
            vec![Some(Payload::Disconnect {
                reason_code: ReasonCode::WrongBroker,
                broker_info: None,
            })],
        )
        .await;

        let result = session.update_location(Location::new(9.0, 9.0)).await;
        assert!(matches!(result, Err(Error::NoResponsibleBroker)));
    }

    #[tokio::test]
    async fn terminate_always_completes() {
        let (session, sent, torn_down) = connected_session("client", vec![]).await;
        session.terminate().await;

        let sent = sent.lock().unwrap();
        let disconnects = sent
            .iter()
            .filter(|payload| {
                matches!(
                    payload,
                    Payload::Disconnect {
                        reason_code: ReasonCode::NormalDisconnection,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(disconnects, 1);
        assert!(*torn_down.lock().unwrap());
    }

    #[tokio::test]
    async fn terminate_survives_lingering_workers() {
        let mut transport = MockTransport::scripted(vec![conn_ack()]);
        transport.workers_exit = false;
        let sent = transport.sent.clone();
        let connector = MockConnector::new(vec![transport]);

        let session =
            Session::establish(test_config("client"), Location::new(1.0, 1.0), connector)
                .await
                .unwrap();
        // 后台任务不退出也必须正常返回
        session.terminate().await;

        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_sends_encoded_message() {
        let (mut session, sent, _) = connected_session("client", vec![]).await;
        let message = FunctionMessage::new("f1", FunctionAction::Call, "x", TypeCode::Normal);

        session
            .publish(&Topic::new("functions/f1/call"), &message, &fence(2.0))
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        match &sent[1] {
            Payload::Publish { topic, content, .. } => {
                assert_eq!(topic.0, "functions/f1/call");
                assert_eq!(
                    serde_json::from_str::<FunctionMessage>(content).unwrap(),
                    message
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
