use std::collections::HashMap;

use crate::network::payload::{Geofence, Topic};

use super::ClientType;

/// 一条正在监听的订阅
#[derive(Debug, Clone, PartialEq)]
pub struct ListeningTopic {
    pub topic: Topic,
    pub fence: Geofence,
}

/// 本客户端当前活跃的 (topic, fence) 订阅集合
/// 以 topic 字符串为唯一键；重复订阅不会覆盖或合并已有围栏
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, Geofence>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只按主题字符串判断，不比较围栏
    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains_key(&topic.0)
    }

    pub fn insert(&mut self, entry: ListeningTopic) {
        self.topics.entry(entry.topic.0).or_insert(entry.fence);
    }

    pub fn remove(&mut self, topic: &Topic) -> bool {
        self.topics.remove(&topic.0).is_some()
    }

    pub fn fence(&self, topic: &Topic) -> Option<&Geofence> {
        self.topics.get(&topic.0)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// 按函数名分组，列出各函数正在监听的动作后缀
    pub fn subscribed_functions(&self) -> HashMap<String, Vec<String>> {
        let mut functions: HashMap<String, Vec<String>> = HashMap::new();
        for topic in self.topics.keys() {
            // functions/<name>/<action>
            let mut levels = topic.split('/').skip(1);
            if let (Some(name), Some(action)) = (levels.next(), levels.next()) {
                functions
                    .entry(name.to_owned())
                    .or_default()
                    .push(action.to_owned());
            }
        }

        functions
    }
}

/// 按角色展开函数名对应的监听主题，第一个是主主题
/// EDGE/CLOUD 监听 call，CLIENT 监听 result
/// CLIENT 额外监听 ack，CLOUD 额外监听 nack
pub fn function_topics(mode: ClientType, func_name: &str) -> Vec<Topic> {
    let action = match mode {
        ClientType::Edge | ClientType::Cloud => "call",
        ClientType::Client => "result",
    };
    let mut topics = vec![Topic::new(format!("functions/{}/{}", func_name, action))];

    match mode {
        ClientType::Client => topics.push(Topic::new(format!("functions/{}/ack", func_name))),
        ClientType::Cloud => topics.push(Topic::new(format!("functions/{}/nack", func_name))),
        ClientType::Edge => {}
    }

    topics
}
