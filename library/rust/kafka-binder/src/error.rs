use crate::codec::CodecError;

/// BinderError はエンドポイントのバインド・送信・ライフサイクル操作に関するエラーを表す。
///
/// ConfigMissing / TypeMismatch / CodecResolution / ContainerStart は起動時の致命的エラーであり、
/// 呼び出し側はプロセスの起動を中止することが想定されている。
#[derive(Debug, thiserror::Error)]
pub enum BinderError {
    #[error("configuration '{configuration}' not found for endpoint '{endpoint}'")]
    ConfigMissing {
        endpoint: String,
        configuration: String,
    },

    #[error("endpoint '{endpoint}' does not implement {expected}")]
    TypeMismatch {
        endpoint: String,
        expected: &'static str,
    },

    #[error("codec component '{name}' for {slot} not found")]
    CodecResolution { slot: CodecSlot, name: String },

    #[error("failed to start container for endpoint '{endpoint}': {reason}")]
    ContainerStart { endpoint: String, reason: String },

    #[error("endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    #[error("send handle is already bound")]
    AlreadyBound,

    #[error("send handle is not bound")]
    NotBound,

    #[error("lifecycle tracker is already shut down")]
    ShutDown,

    #[error("broker client error: {0}")]
    Client(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("send error: {0}")]
    Send(String),
}

/// CodecSlot はコーデックを適用するレコードの位置（キー / 値）を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSlot {
    KeySerializer,
    ValueSerializer,
    KeyDeserializer,
    ValueDeserializer,
}

impl std::fmt::Display for CodecSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CodecSlot::KeySerializer => "key serializer",
            CodecSlot::ValueSerializer => "value serializer",
            CodecSlot::KeyDeserializer => "key deserializer",
            CodecSlot::ValueDeserializer => "value deserializer",
        };
        f.write_str(s)
    }
}
