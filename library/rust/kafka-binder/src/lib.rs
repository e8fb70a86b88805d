//! k1s0-kafka-binder: 名前付き設定プロファイルで Kafka エンドポイントをバインドするライブラリ。
//!
//! アプリケーションが宣言したプロデューサー・コンシューマーを、起動時に一度だけ解決される
//! 設定プロファイルに従ってブローカークライアントへ接続する。コンシューマーのコンテナは
//! LifecycleTracker が保持し、シャットダウン時に一括で停止する。

pub mod binder;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod container;
pub mod endpoint;
pub mod error;
pub mod factory;
#[cfg(feature = "kafka")]
pub mod kafka_client;
pub mod lifecycle;
pub mod memory;
pub mod producer;
pub mod resolver;

pub use binder::KafkaBinder;
pub use client::{BrokerClient, ConsumerClient, ProducerClient, ProducerRecord, RawRecord, SendResult};
pub use codec::{CodecComponents, CodecError, ComponentRegistry, Deserializer, Serializer};
pub use config::{
    CodecSpec, ConfigError, ConfigurationRegistry, ConsumerConfig, KafkaBinderConfig,
    ProducerConfig,
};
pub use consumer::{ConsumerBinder, ConsumerBindingState};
pub use container::{ContainerFactory, MessageListenerContainer};
pub use endpoint::{
    ConsumerRecord, Endpoint, EndpointDeclaration, EndpointKind, MessageListener,
    ProducerEndpoint,
};
pub use error::{BinderError, CodecSlot};
pub use factory::{ConsumerFactory, ConsumerFactoryBuilder, ProducerFactory, ProducerFactoryBuilder};
#[cfg(feature = "kafka")]
pub use kafka_client::RdKafkaClient;
pub use lifecycle::LifecycleTracker;
pub use memory::InMemoryBroker;
pub use producer::{ProducerBinder, SendHandle, SendHandleSlot};
pub use resolver::{ResolvedCodecs, SerializationResolver};

#[cfg(feature = "mock")]
pub use client::{MockBrokerClient, MockProducerClient};
#[cfg(feature = "mock")]
pub use codec::MockComponentRegistry;
#[cfg(feature = "mock")]
pub use config::MockConfigurationRegistry;
#[cfg(feature = "mock")]
pub use endpoint::MockMessageListener;
