//! RdKafkaClient: rdkafka を使用した BrokerClient 実装。
//! feature = "kafka" で有効化される。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::client::{
    BrokerClient, ConsumerClient, ProducerClient, ProducerRecord, RawRecord, SendResult,
};
use crate::error::BinderError;
use crate::factory::{ConsumerFactory, ProducerFactory, CODEC_PROPERTIES, GROUP_ID};

/// 送信完了を待つ上限。
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// RdKafkaClient はファクトリのプロパティを librdkafka の設定として渡す。
/// コーデックのクラス指定はバインダー側で適用するため除外する。
#[derive(Debug, Default, Clone, Copy)]
pub struct RdKafkaClient;

impl RdKafkaClient {
    pub fn new() -> Self {
        Self
    }
}

fn client_config<'a>(properties: impl Iterator<Item = (&'a String, &'a String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        if !CODEC_PROPERTIES.contains(&key.as_str()) {
            config.set(key, value);
        }
    }
    config
}

impl BrokerClient for RdKafkaClient {
    fn create_producer(
        &self,
        factory: &ProducerFactory,
    ) -> Result<Arc<dyn ProducerClient>, BinderError> {
        tracing::debug!(
            configure_serializers = factory.configures_serializers(),
            "creating kafka producer, codec class properties are applied by the binder"
        );
        let producer: FutureProducer = client_config(factory.properties().iter())
            .create()
            .map_err(|e| BinderError::Client(e.to_string()))?;
        Ok(Arc::new(RdKafkaProducer { producer }))
    }

    fn create_consumer(
        &self,
        factory: &ConsumerFactory,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn ConsumerClient>, BinderError> {
        tracing::debug!(
            configure_deserializers = factory.configures_deserializers(),
            "creating kafka consumer, codec class properties are applied by the binder"
        );
        let mut config = client_config(factory.properties().iter());
        config.set(GROUP_ID, group_id);
        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| BinderError::Client(e.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BinderError::Client(e.to_string()))?;

        tracing::info!(topic = %topic, group = %group_id, "kafka consumer subscribed");
        Ok(Box::new(RdKafkaConsumer {
            consumer: Some(consumer),
        }))
    }
}

struct RdKafkaProducer {
    producer: FutureProducer,
}

#[async_trait]
impl ProducerClient for RdKafkaProducer {
    async fn send(&self, record: ProducerRecord) -> Result<SendResult, BinderError> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).payload(record.payload.as_slice());
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }
        if let Some(timestamp) = record.timestamp {
            future_record = future_record.timestamp(timestamp);
        }

        let delivery = self
            .producer
            .send(future_record, SEND_TIMEOUT)
            .await
            .map_err(|(err, _)| BinderError::Send(err.to_string()))?;

        Ok(SendResult {
            topic: record.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }
}

struct RdKafkaConsumer {
    consumer: Option<StreamConsumer>,
}

#[async_trait]
impl ConsumerClient for RdKafkaConsumer {
    async fn poll(&mut self) -> Result<Option<RawRecord>, BinderError> {
        let Some(consumer) = self.consumer.as_ref() else {
            return Ok(None);
        };
        let msg = consumer
            .recv()
            .await
            .map_err(|e| BinderError::Client(e.to_string()))?;

        Ok(Some(RawRecord {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec),
            timestamp: msg.timestamp().to_millis(),
        }))
    }

    async fn close(&mut self) -> Result<(), BinderError> {
        // drop で librdkafka がグループから離脱する
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        Ok(())
    }
}
