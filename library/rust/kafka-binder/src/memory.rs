//! InMemoryBroker: テスト・ローカル開発用のインメモリブローカー実装。
//!
//! 送信レコードは記録され、同じトピックを購読しているグループごとに1メンバーへ
//! ラウンドロビンで配送される。購読前に送信されたレコードは再配送しない。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{
    BrokerClient, ConsumerClient, ProducerClient, ProducerRecord, RawRecord, SendResult,
};
use crate::error::BinderError;
use crate::factory::{ConsumerFactory, ProducerFactory};

type Subscription = (String, String);

struct Member {
    id: u64,
    tx: mpsc::UnboundedSender<RawRecord>,
}

#[derive(Default)]
struct BrokerState {
    sent: Vec<ProducerRecord>,
    offsets: HashMap<(String, i32), i64>,
    members: HashMap<Subscription, Vec<Member>>,
    cursors: HashMap<Subscription, usize>,
    next_member_id: u64,
    producers_created: usize,
    consumers_created: usize,
    consumers_closed: usize,
    failing_topics: HashSet<String>,
}

impl BrokerState {
    fn deliver(&mut self, record: ProducerRecord) -> SendResult {
        let partition = record.partition.unwrap_or(0);
        let offset = {
            let next = self
                .offsets
                .entry((record.topic.clone(), partition))
                .or_insert(0);
            let current = *next;
            *next += 1;
            current
        };

        let raw = RawRecord {
            topic: record.topic.clone(),
            partition,
            offset,
            key: record.key.clone(),
            payload: Some(record.payload.clone()),
            timestamp: record.timestamp,
        };
        let subscriptions: Vec<Subscription> = self
            .members
            .iter()
            .filter(|((topic, _), members)| *topic == record.topic && !members.is_empty())
            .map(|(subscription, _)| subscription.clone())
            .collect();
        for subscription in subscriptions {
            let cursor = self.cursors.entry(subscription.clone()).or_insert(0);
            if let Some(members) = self.members.get(&subscription) {
                let member = &members[*cursor % members.len()];
                *cursor += 1;
                let _ = member.tx.send(raw.clone());
            }
        }

        let result = SendResult {
            topic: record.topic.clone(),
            partition,
            offset,
        };
        self.sent.push(record);
        result
    }

    fn leave(&mut self, subscription: &Subscription, id: u64) {
        if let Some(members) = self.members.get_mut(subscription) {
            members.retain(|m| m.id != id);
        }
    }
}

/// InMemoryBroker は BrokerClient のインメモリ実装。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// プロデューサーを経由せずにレコードを投入する。
    pub fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> SendResult {
        self.state().deliver(ProducerRecord {
            topic: topic.to_string(),
            partition: None,
            timestamp: None,
            key: key.map(<[u8]>::to_vec),
            payload: payload.to_vec(),
        })
    }

    /// 以後 topic のコンシューマー生成を失敗させる。
    pub fn fail_consumers_for(&self, topic: &str) {
        self.state().failing_topics.insert(topic.to_string());
    }

    /// これまでに送信された全レコード。
    pub fn sent_records(&self) -> Vec<ProducerRecord> {
        self.state().sent.clone()
    }

    pub fn producers_created(&self) -> usize {
        self.state().producers_created
    }

    pub fn consumers_created(&self) -> usize {
        self.state().consumers_created
    }

    pub fn closed_consumers(&self) -> usize {
        self.state().consumers_closed
    }

    /// topic / group_id の購読中メンバー数。
    pub fn active_members(&self, topic: &str, group_id: &str) -> usize {
        self.state()
            .members
            .get(&(topic.to_string(), group_id.to_string()))
            .map_or(0, Vec::len)
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerClient for InMemoryBroker {
    fn create_producer(
        &self,
        _factory: &ProducerFactory,
    ) -> Result<Arc<dyn ProducerClient>, BinderError> {
        self.state().producers_created += 1;
        Ok(Arc::new(InMemoryProducer {
            state: self.state.clone(),
        }))
    }

    fn create_consumer(
        &self,
        _factory: &ConsumerFactory,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn ConsumerClient>, BinderError> {
        let mut state = self.state();
        if state.failing_topics.contains(topic) {
            return Err(BinderError::Client(format!(
                "subscription to '{topic}' rejected"
            )));
        }

        let id = state.next_member_id;
        state.next_member_id += 1;
        state.consumers_created += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = (topic.to_string(), group_id.to_string());
        state
            .members
            .entry(subscription.clone())
            .or_default()
            .push(Member { id, tx });

        Ok(Box::new(InMemoryConsumer {
            id,
            subscription,
            rx,
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct InMemoryProducer {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl ProducerClient for InMemoryProducer {
    async fn send(&self, record: ProducerRecord) -> Result<SendResult, BinderError> {
        Ok(lock(&self.state).deliver(record))
    }
}

struct InMemoryConsumer {
    id: u64,
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<RawRecord>,
    state: Arc<Mutex<BrokerState>>,
    closed: bool,
}

#[async_trait]
impl ConsumerClient for InMemoryConsumer {
    async fn poll(&mut self) -> Result<Option<RawRecord>, BinderError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), BinderError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.rx.close();
        let mut state = lock(&self.state);
        state.leave(&self.subscription, self.id);
        state.consumers_closed += 1;
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            lock(&self.state).leave(&self.subscription, self.id);
        }
    }
}
