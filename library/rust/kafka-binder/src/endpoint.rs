use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BinderError;
use crate::producer::SendHandle;

/// EndpointKind はエンドポイントの種別を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Producer,
    Consumer,
}

/// ConsumerRecord はデコード済みの受信レコードを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Value>,
    pub value: Value,
    pub timestamp: Option<i64>,
}

impl ConsumerRecord {
    /// キーが文字列であればその値を返す。
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_ref().and_then(Value::as_str)
    }

    /// 値を任意の型としてデシリアライズする。
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

/// MessageListener はコンシューマーエンドポイントのメッセージハンドラー。
/// バインドされたコンテナからレコード1件ごとに呼び出される。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, record: ConsumerRecord) -> anyhow::Result<()>;
}

/// ProducerEndpoint はプロデューサーエンドポイントの送信ハンドル注入口。
pub trait ProducerEndpoint: Send + Sync {
    /// 送信ハンドルを注入する。最初の送信より前に呼ばれる。
    fn set_send_handle(&self, handle: SendHandle) -> Result<(), BinderError>;
}

/// Endpoint はバインド対象のアプリケーションコンポーネント。
///
/// 宣言した種別に対応するケイパビリティを返す必要がある。対応しない場合、
/// バインド時に TypeMismatch となる。
pub trait Endpoint: Send + Sync + 'static {
    fn as_producer(&self) -> Option<&dyn ProducerEndpoint> {
        None
    }

    fn as_listener(self: Arc<Self>) -> Option<Arc<dyn MessageListener>> {
        None
    }
}

/// EndpointDeclaration は composition root で組み立てるエンドポイント宣言。
#[derive(Clone)]
pub struct EndpointDeclaration {
    pub identity: String,
    pub kind: EndpointKind,
    pub configuration_name: String,
    pub component: Arc<dyn Endpoint>,
}

impl EndpointDeclaration {
    pub fn producer<E: Endpoint>(
        identity: impl Into<String>,
        configuration_name: impl Into<String>,
        component: Arc<E>,
    ) -> Self {
        Self {
            identity: identity.into(),
            kind: EndpointKind::Producer,
            configuration_name: configuration_name.into(),
            component,
        }
    }

    pub fn consumer<E: Endpoint>(
        identity: impl Into<String>,
        configuration_name: impl Into<String>,
        component: Arc<E>,
    ) -> Self {
        Self {
            identity: identity.into(),
            kind: EndpointKind::Consumer,
            configuration_name: configuration_name.into(),
            component,
        }
    }
}

impl std::fmt::Debug for EndpointDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDeclaration")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("configuration_name", &self.configuration_name)
            .finish_non_exhaustive()
    }
}
