use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::client::{BrokerClient, ProducerClient, ProducerRecord, SendResult};
use crate::codec::{CodecError, Serializer};
use crate::config::ConfigurationRegistry;
use crate::endpoint::EndpointDeclaration;
use crate::error::BinderError;
use crate::factory::{ProducerFactory, ProducerFactoryBuilder};
use crate::resolver::SerializationResolver;

/// SendHandle はエンドポイント専用の送信ハンドル。デフォルトトピックに束縛される。
/// エンドポイント間で共有しないため Clone を実装しない。
pub struct SendHandle {
    client: Arc<dyn ProducerClient>,
    default_topic: String,
    key_serializer: Arc<dyn Serializer>,
    value_serializer: Arc<dyn Serializer>,
}

impl SendHandle {
    pub fn new(
        client: Arc<dyn ProducerClient>,
        factory: &ProducerFactory,
        default_topic: impl Into<String>,
    ) -> Self {
        Self {
            client,
            default_topic: default_topic.into(),
            key_serializer: factory.key_serializer().clone(),
            value_serializer: factory.value_serializer().clone(),
        }
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// 値のみをデフォルトトピックへ送信する。
    pub async fn send<V: Serialize + ?Sized>(&self, value: &V) -> Result<SendResult, BinderError> {
        let value = self.to_value(value)?;
        self.dispatch(None, None, None, value).await
    }

    /// キーと値をデフォルトトピックへ送信する。
    pub async fn send_keyed<K, V>(&self, key: &K, value: &V) -> Result<SendResult, BinderError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = self.to_value(key)?;
        let value = self.to_value(value)?;
        self.dispatch(None, None, Some(key), value).await
    }

    /// パーティションを指定して送信する。
    pub async fn send_to_partition<K, V>(
        &self,
        partition: i32,
        key: &K,
        value: &V,
    ) -> Result<SendResult, BinderError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = self.to_value(key)?;
        let value = self.to_value(value)?;
        self.dispatch(Some(partition), None, Some(key), value).await
    }

    /// パーティションとタイムスタンプ（エポックミリ秒）を指定して送信する。
    pub async fn send_with_timestamp<K, V>(
        &self,
        partition: i32,
        timestamp: i64,
        key: &K,
        value: &V,
    ) -> Result<SendResult, BinderError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = self.to_value(key)?;
        let value = self.to_value(value)?;
        self.dispatch(Some(partition), Some(timestamp), Some(key), value)
            .await
    }

    fn to_value<T: Serialize + ?Sized>(&self, data: &T) -> Result<Value, BinderError> {
        serde_json::to_value(data).map_err(|e| {
            BinderError::Codec(CodecError::Serialize {
                topic: self.default_topic.clone(),
                reason: e.to_string(),
            })
        })
    }

    async fn dispatch(
        &self,
        partition: Option<i32>,
        timestamp: Option<i64>,
        key: Option<Value>,
        value: Value,
    ) -> Result<SendResult, BinderError> {
        let key = key
            .map(|k| self.key_serializer.serialize(&self.default_topic, &k))
            .transpose()?;
        let payload = self.value_serializer.serialize(&self.default_topic, &value)?;

        self.client
            .send(ProducerRecord {
                topic: self.default_topic.clone(),
                partition,
                timestamp,
                key,
                payload,
            })
            .await
    }
}

impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle")
            .field("default_topic", &self.default_topic)
            .finish_non_exhaustive()
    }
}

/// SendHandleSlot はプロデューサーエンドポイントに埋め込む送信ハンドルの格納先。
/// ハンドルは一度だけ注入できる。
#[derive(Debug, Default)]
pub struct SendHandleSlot {
    handle: OnceLock<SendHandle>,
}

impl SendHandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// ハンドルを注入する。既に注入済みの場合は AlreadyBound。
    pub fn inject(&self, handle: SendHandle) -> Result<(), BinderError> {
        self.handle.set(handle).map_err(|_| BinderError::AlreadyBound)
    }

    /// 注入済みのハンドルを返す。未注入の場合は NotBound。
    pub fn handle(&self) -> Result<&SendHandle, BinderError> {
        self.handle.get().ok_or(BinderError::NotBound)
    }

    pub fn is_bound(&self) -> bool {
        self.handle.get().is_some()
    }

    pub async fn send<V: Serialize + ?Sized>(&self, value: &V) -> Result<SendResult, BinderError> {
        self.handle()?.send(value).await
    }

    pub async fn send_keyed<K, V>(&self, key: &K, value: &V) -> Result<SendResult, BinderError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        self.handle()?.send_keyed(key, value).await
    }
}

/// ProducerBinder はプロデューサーエンドポイントごとに専用の送信ハンドルを構築して注入する。
/// 送信ハンドルはデフォルトトピックを持つため、エンドポイント間でキャッシュしない。
pub struct ProducerBinder {
    registry: Arc<dyn ConfigurationRegistry>,
    resolver: SerializationResolver,
    client: Arc<dyn BrokerClient>,
    bound: Mutex<HashSet<String>>,
}

impl ProducerBinder {
    pub fn new(
        registry: Arc<dyn ConfigurationRegistry>,
        resolver: SerializationResolver,
        client: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            registry,
            resolver,
            client,
            bound: Mutex::new(HashSet::new()),
        }
    }

    fn bound(&self) -> MutexGuard<'_, HashSet<String>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 識別子がバインド済みかどうか。
    pub fn is_bound(&self, identity: &str) -> bool {
        self.bound().contains(identity)
    }

    /// エンドポイントを設定名で解決し、送信ハンドルを注入する。
    ///
    /// 同じ識別子の2回目以降のバインドは、クライアントを生成する前に DuplicateEndpoint で失敗する。
    pub fn bind(&self, declaration: &EndpointDeclaration) -> Result<(), BinderError> {
        let config = self
            .registry
            .producer(&declaration.configuration_name)
            .ok_or_else(|| BinderError::ConfigMissing {
                endpoint: declaration.identity.clone(),
                configuration: declaration.configuration_name.clone(),
            })?;

        let producer =
            declaration
                .component
                .as_producer()
                .ok_or_else(|| BinderError::TypeMismatch {
                    endpoint: declaration.identity.clone(),
                    expected: "ProducerEndpoint",
                })?;

        if !self.bound().insert(declaration.identity.clone()) {
            return Err(BinderError::DuplicateEndpoint(declaration.identity.clone()));
        }

        let injected = (|| {
            let resolved = self
                .resolver
                .resolve_serializers(&config.key_codec(), &config.value_codec())?;
            let factory = ProducerFactoryBuilder::of(&config)
                .with_resolved(resolved)
                .build()?;

            let client = self.client.create_producer(&factory)?;
            producer.set_send_handle(SendHandle::new(client, &factory, config.topic.clone()))
        })();
        if let Err(e) = injected {
            self.bound().remove(&declaration.identity);
            return Err(e);
        }

        tracing::info!(
            endpoint = %declaration.identity,
            configuration = %declaration.configuration_name,
            topic = %config.topic,
            "kafka producer endpoint bound"
        );
        Ok(())
    }
}
