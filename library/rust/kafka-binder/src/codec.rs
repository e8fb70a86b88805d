//! レコードのキー・値を変換するコーデック。
//!
//! コーデックはクラス指定（組み込み識別子）またはコンポーネント名で指定される。
//! 組み込み識別子は `string`、`json`、`bytes`。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// 組み込み文字列コーデックの識別子。
pub const STRING_CODEC: &str = "string";
/// 組み込み JSON コーデックの識別子。
pub const JSON_CODEC: &str = "json";
/// 組み込みバイト列コーデックの識別子。
pub const BYTES_CODEC: &str = "bytes";

/// CodecError はシリアライズ・デシリアライズ失敗を表す。
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization error on topic '{topic}': {reason}")]
    Serialize { topic: String, reason: String },

    #[error("deserialization error on topic '{topic}': {reason}")]
    Deserialize { topic: String, reason: String },
}

/// Serializer は送信するキー・値をバイト列に変換する。
pub trait Serializer: Send + Sync {
    fn serialize(&self, topic: &str, data: &Value) -> Result<Vec<u8>, CodecError>;
}

/// Deserializer は受信したバイト列をキー・値に復元する。
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, topic: &str, data: &[u8]) -> Result<Value, CodecError>;
}

/// StringCodec は UTF-8 文字列としてエンコードする。
/// 文字列以外の値は JSON テキストとして書き出す。
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Serializer for StringCodec {
    fn serialize(&self, _topic: &str, data: &Value) -> Result<Vec<u8>, CodecError> {
        match data {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Ok(other.to_string().into_bytes()),
        }
    }
}

impl Deserializer for StringCodec {
    fn deserialize(&self, topic: &str, data: &[u8]) -> Result<Value, CodecError> {
        let s = std::str::from_utf8(data).map_err(|e| CodecError::Deserialize {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Value::String(s.to_string()))
    }
}

/// JsonCodec は serde_json でエンコードする。
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Serializer for JsonCodec {
    fn serialize(&self, topic: &str, data: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(data).map_err(|e| CodecError::Serialize {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Deserializer for JsonCodec {
    fn deserialize(&self, topic: &str, data: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Deserialize {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

/// BytesCodec は値をそのままのバイト列として扱う。
///
/// 送信時は文字列（UTF-8 バイト）または 0〜255 の数値配列を受け付け、
/// 受信時は数値配列に復元する。
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Serializer for BytesCodec {
    fn serialize(&self, topic: &str, data: &Value) -> Result<Vec<u8>, CodecError> {
        match data {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| CodecError::Serialize {
                            topic: topic.to_string(),
                            reason: format!("not a byte: {item}"),
                        })
                })
                .collect(),
            other => Err(CodecError::Serialize {
                topic: topic.to_string(),
                reason: format!("expected string or byte array, got {other}"),
            }),
        }
    }
}

impl Deserializer for BytesCodec {
    fn deserialize(&self, _topic: &str, data: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::Array(data.iter().map(|b| Value::from(*b)).collect()))
    }
}

/// 組み込み識別子からシリアライザーを取得する。未知の識別子は None。
pub fn builtin_serializer(class: &str) -> Option<Arc<dyn Serializer>> {
    match class {
        STRING_CODEC => Some(Arc::new(StringCodec)),
        JSON_CODEC => Some(Arc::new(JsonCodec)),
        BYTES_CODEC => Some(Arc::new(BytesCodec)),
        _ => None,
    }
}

/// 組み込み識別子からデシリアライザーを取得する。未知の識別子は None。
pub fn builtin_deserializer(class: &str) -> Option<Arc<dyn Deserializer>> {
    match class {
        STRING_CODEC => Some(Arc::new(StringCodec)),
        JSON_CODEC => Some(Arc::new(JsonCodec)),
        BYTES_CODEC => Some(Arc::new(BytesCodec)),
        _ => None,
    }
}

/// ComponentRegistry は名前でコーデックコンポーネントを引くためのインターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ComponentRegistry: Send + Sync {
    fn serializer(&self, name: &str) -> Option<Arc<dyn Serializer>>;
    fn deserializer(&self, name: &str) -> Option<Arc<dyn Deserializer>>;
}

/// CodecComponents は HashMap ベースの ComponentRegistry 実装。
#[derive(Default, Clone)]
pub struct CodecComponents {
    serializers: HashMap<String, Arc<dyn Serializer>>,
    deserializers: HashMap<String, Arc<dyn Deserializer>>,
}

impl CodecComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// 名前付きシリアライザーを登録する（ビルダーパターン）。
    pub fn with_serializer(mut self, name: impl Into<String>, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.insert(name.into(), serializer);
        self
    }

    /// 名前付きデシリアライザーを登録する（ビルダーパターン）。
    pub fn with_deserializer(
        mut self,
        name: impl Into<String>,
        deserializer: Arc<dyn Deserializer>,
    ) -> Self {
        self.deserializers.insert(name.into(), deserializer);
        self
    }
}

impl ComponentRegistry for CodecComponents {
    fn serializer(&self, name: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(name).cloned()
    }

    fn deserializer(&self, name: &str) -> Option<Arc<dyn Deserializer>> {
        self.deserializers.get(name).cloned()
    }
}
