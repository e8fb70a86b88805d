//! ブローカークライアントとの境界。
//!
//! ワイヤープロトコルは外部クライアント（rdkafka 等）に委ねる。バインダーは
//! ここで定義するトレイトだけに依存する。

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BinderError;
use crate::factory::{ConsumerFactory, ProducerFactory};

/// ProducerRecord はエンコード済みの送信レコードを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// 明示したパーティション。None の場合はクライアントのパーティショナーに任せる
    pub partition: Option<i32>,
    /// タイムスタンプ（エポックミリ秒）
    pub timestamp: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// SendResult は送信完了時にブローカーが割り当てた位置を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// RawRecord はブローカーから受信したデコード前のレコードを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

/// BrokerClient はファクトリ設定からプロデューサー・コンシューマーを生成する。
///
/// コーデックはファクトリの解決済みインスタンスをバインダー側で適用する。
/// `key.serializer` 等のクラス指定プロパティと `configures_*` フラグは参考情報で、
/// ワイヤー上のエンコードには使われない。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait BrokerClient: Send + Sync {
    /// プロデューサークライアントを生成する。
    fn create_producer(&self, factory: &ProducerFactory)
        -> Result<Arc<dyn ProducerClient>, BinderError>;

    /// topic を group_id で購読するコンシューマークライアントを生成する。
    /// 生成した時点でグループに参加し、close で離脱する。
    fn create_consumer(
        &self,
        factory: &ConsumerFactory,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn ConsumerClient>, BinderError>;
}

/// ProducerClient はエンコード済みレコードを送信する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> Result<SendResult, BinderError>;
}

/// ConsumerClient は購読中のトピックからレコードを取得する。
#[async_trait]
pub trait ConsumerClient: Send {
    /// 次のレコードを待つ。ストリームが終了した場合は None を返す。
    async fn poll(&mut self) -> Result<Option<RawRecord>, BinderError>;

    /// 購読を終了してコンシューマーグループから離脱する。
    async fn close(&mut self) -> Result<(), BinderError>;
}
