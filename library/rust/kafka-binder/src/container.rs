//! MessageListenerContainer: 1つのコンシューマーエンドポイントに束縛されたポーリングユニット。
//!
//! start でバックグラウンドタスクを起動し、stop でキャンセルしてタスクの終了を待つ。
//! タスクは終了前に必ずコンシューマーを close し、グループから離脱する。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{BrokerClient, ConsumerClient, RawRecord};
use crate::codec::{CodecError, Deserializer};
use crate::endpoint::{ConsumerRecord, MessageListener};
use crate::error::BinderError;
use crate::factory::{ConsumerFactory, GROUP_ID};

/// ContainerFactory は設定名ごとに共有されるコンテナファクトリ。
pub struct ContainerFactory {
    configuration_name: String,
    consumer_factory: Arc<ConsumerFactory>,
    client: Arc<dyn BrokerClient>,
}

impl ContainerFactory {
    pub fn new(
        configuration_name: impl Into<String>,
        consumer_factory: ConsumerFactory,
        client: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            configuration_name: configuration_name.into(),
            consumer_factory: Arc::new(consumer_factory),
            client,
        }
    }

    pub fn configuration_name(&self) -> &str {
        &self.configuration_name
    }

    pub fn consumer_factory(&self) -> &ConsumerFactory {
        &self.consumer_factory
    }

    /// topic を購読するコンテナを生成する。グループ ID はファクトリ設定の group.id で初期化される。
    pub fn create_container(&self, endpoint: &str, topic: &str) -> MessageListenerContainer {
        MessageListenerContainer {
            endpoint: endpoint.to_string(),
            topic: topic.to_string(),
            group_id: self
                .consumer_factory
                .property(GROUP_ID)
                .unwrap_or_default()
                .to_string(),
            factory: self.consumer_factory.clone(),
            client: self.client.clone(),
            listener: None,
            running: None,
        }
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// MessageListenerContainer は購読・ポーリング・ハンドラー呼び出しを行う。
pub struct MessageListenerContainer {
    endpoint: String,
    topic: String,
    group_id: String,
    factory: Arc<ConsumerFactory>,
    client: Arc<dyn BrokerClient>,
    listener: Option<Arc<dyn MessageListener>>,
    running: Option<RunningTask>,
}

impl MessageListenerContainer {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn set_group_id(&mut self, group_id: impl Into<String>) {
        self.group_id = group_id.into();
    }

    pub fn set_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.listener = Some(listener);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// コンシューマーを生成してポーリングタスクを起動する。
    ///
    /// tokio ランタイムの外で呼ばれた場合はコンシューマーを生成せずに ContainerStart を返す。
    pub fn start(&mut self) -> Result<(), BinderError> {
        if self.running.is_some() {
            return Ok(());
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| BinderError::ContainerStart {
                endpoint: self.endpoint.clone(),
                reason: "no tokio runtime".to_string(),
            })?;
        let listener = self
            .listener
            .clone()
            .ok_or_else(|| BinderError::ContainerStart {
                endpoint: self.endpoint.clone(),
                reason: "no message listener set".to_string(),
            })?;

        let consumer = self
            .client
            .create_consumer(&self.factory, &self.topic, &self.group_id)
            .map_err(|e| BinderError::ContainerStart {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let token = CancellationToken::new();
        let worker = PollWorker {
            endpoint: self.endpoint.clone(),
            listener,
            key_deserializer: self.factory.key_deserializer().clone(),
            value_deserializer: self.factory.value_deserializer().clone(),
        };
        let handle = runtime.spawn(worker.run(consumer, token.clone()));
        self.running = Some(RunningTask { token, handle });

        tracing::info!(
            endpoint = %self.endpoint,
            topic = %self.topic,
            group = %self.group_id,
            "kafka listener container started"
        );
        Ok(())
    }

    /// ポーリングを停止し、タスクの完全な終了を待つ。2回目以降の呼び出しは何もしない。
    pub async fn stop(&mut self) {
        let Some(task) = self.running.take() else {
            return;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            tracing::error!(endpoint = %self.endpoint, error = %e, "kafka listener task panicked");
        }
        tracing::info!(
            endpoint = %self.endpoint,
            topic = %self.topic,
            "kafka listener container stopped"
        );
    }
}

impl Drop for MessageListenerContainer {
    fn drop(&mut self) {
        // 停止されずに破棄された場合もタスクを残さない
        if let Some(task) = self.running.take() {
            task.token.cancel();
        }
    }
}

struct PollWorker {
    endpoint: String,
    listener: Arc<dyn MessageListener>,
    key_deserializer: Arc<dyn Deserializer>,
    value_deserializer: Arc<dyn Deserializer>,
}

impl PollWorker {
    async fn run(self, mut consumer: Box<dyn ConsumerClient>, token: CancellationToken) {
        loop {
            // ハンドラーの実行中はキャンセルを待たない。実行中のレコードは処理を完了させる。
            let polled = tokio::select! {
                biased;
                () = token.cancelled() => break,
                polled = consumer.poll() => polled,
            };

            match polled {
                Ok(Some(raw)) => self.dispatch(raw).await,
                Ok(None) => {
                    tracing::warn!(endpoint = %self.endpoint, "kafka consumer stream ended");
                    break;
                }
                Err(e) => {
                    tracing::error!(endpoint = %self.endpoint, error = %e, "kafka consumer error");
                }
            }
        }

        if let Err(e) = consumer.close().await {
            tracing::error!(endpoint = %self.endpoint, error = %e, "failed to close kafka consumer");
        }
    }

    async fn dispatch(&self, raw: RawRecord) {
        let offset = raw.offset;
        let record = match self.decode(raw) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(endpoint = %self.endpoint, offset, "received kafka message with empty payload");
                return;
            }
            Err(e) => {
                tracing::error!(endpoint = %self.endpoint, offset, error = %e, "failed to deserialize kafka message");
                return;
            }
        };

        let topic = record.topic.clone();
        let partition = record.partition;
        if let Err(e) = self.listener.on_message(record).await {
            tracing::error!(
                endpoint = %self.endpoint,
                topic = %topic,
                partition,
                offset,
                error = %e,
                "kafka message handler failed"
            );
        }
    }

    fn decode(&self, raw: RawRecord) -> Result<Option<ConsumerRecord>, CodecError> {
        let Some(payload) = raw.payload else {
            return Ok(None);
        };
        let key = raw
            .key
            .map(|k| self.key_deserializer.deserialize(&raw.topic, &k))
            .transpose()?;
        let value = self.value_deserializer.deserialize(&raw.topic, &payload)?;
        Ok(Some(ConsumerRecord {
            topic: raw.topic,
            partition: raw.partition,
            offset: raw.offset,
            key,
            value,
            timestamp: raw.timestamp,
        }))
    }
}
