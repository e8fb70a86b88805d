//! プロデューサー・コンシューマーのクライアントファクトリとそのビルダー。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::{builtin_deserializer, builtin_serializer, Deserializer, Serializer};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::{BinderError, CodecSlot};
use crate::resolver::ResolvedCodecs;

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
pub const BATCH_SIZE: &str = "batch.size";
pub const LINGER_MS: &str = "linger.ms";
pub const GROUP_ID: &str = "group.id";
pub const KEY_SERIALIZER: &str = "key.serializer";
pub const VALUE_SERIALIZER: &str = "value.serializer";
pub const KEY_DESERIALIZER: &str = "key.deserializer";
pub const VALUE_DESERIALIZER: &str = "value.deserializer";

/// コーデックのクラス指定プロパティ。ブローカークライアントには渡さない。
pub const CODEC_PROPERTIES: [&str; 4] = [
    KEY_SERIALIZER,
    VALUE_SERIALIZER,
    KEY_DESERIALIZER,
    VALUE_DESERIALIZER,
];

/// ProducerFactory はプロデューサークライアントの生成に必要な設定と解決済みシリアライザーを保持する。
pub struct ProducerFactory {
    properties: BTreeMap<String, String>,
    key_serializer: Arc<dyn Serializer>,
    value_serializer: Arc<dyn Serializer>,
    configure_serializers: bool,
}

impl ProducerFactory {
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn key_serializer(&self) -> &Arc<dyn Serializer> {
        &self.key_serializer
    }

    pub fn value_serializer(&self) -> &Arc<dyn Serializer> {
        &self.value_serializer
    }

    /// クラス指定のシリアライザー設定を有効にするかどうか。
    ///
    /// 上書きされたスロットのクラス指定は build 時点でプロパティから取り除かれているため、
    /// 実効シリアライザーはこの値に依存しない。クラス名を自前で解決するクライアント向けの情報。
    pub fn configures_serializers(&self) -> bool {
        self.configure_serializers
    }
}

impl std::fmt::Debug for ProducerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerFactory")
            .field("properties", &self.properties)
            .field("configure_serializers", &self.configure_serializers)
            .finish_non_exhaustive()
    }
}

/// ProducerFactoryBuilder は ProducerFactory のビルダー。
pub struct ProducerFactoryBuilder {
    properties: BTreeMap<String, String>,
    key_serializer: Option<Arc<dyn Serializer>>,
    value_serializer: Option<Arc<dyn Serializer>>,
    configure_serializers: bool,
}

impl Default for ProducerFactoryBuilder {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            key_serializer: None,
            value_serializer: None,
            configure_serializers: true,
        }
    }
}

impl ProducerFactoryBuilder {
    /// 空のビルダーを返す。
    pub fn empty() -> Self {
        Self::default()
    }

    /// プロデューサー設定で埋めたビルダーを返す。
    pub fn of(config: &ProducerConfig) -> Self {
        let mut builder = Self::empty()
            .config(|props| {
                props.extend(config.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            })
            .property(BOOTSTRAP_SERVERS, &config.bootstrap_servers_string())
            .property(BATCH_SIZE, &config.batch_size.to_string())
            .property(LINGER_MS, &config.linger_ms.to_string());

        if !config.key_serializer.is_empty() {
            builder = builder.property(KEY_SERIALIZER, &config.key_serializer);
        }
        if !config.value_serializer.is_empty() {
            builder = builder.property(VALUE_SERIALIZER, &config.value_serializer);
        }
        builder
    }

    /// プロパティを設定する。
    pub fn property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }

    /// プロパティを取り除く。
    pub fn remove_property(mut self, name: &str) -> Self {
        self.properties.remove(name);
        self
    }

    /// プロパティマップに任意の変更を適用する。
    pub fn config(mut self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Self {
        f(&mut self.properties);
        self
    }

    pub fn key_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.key_serializer = Some(serializer);
        self
    }

    pub fn value_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.value_serializer = Some(serializer);
        self
    }

    pub fn configure_serializers(mut self, configure: bool) -> Self {
        self.configure_serializers = configure;
        self
    }

    /// 解決済みコーデックを適用する。上書きされたスロットのクラス指定は取り除く。
    pub fn with_resolved(mut self, resolved: ResolvedCodecs<dyn Serializer>) -> Self {
        if let Some(key) = resolved.key {
            self = self.key_serializer(key).remove_property(KEY_SERIALIZER);
        }
        if let Some(value) = resolved.value {
            self = self.value_serializer(value).remove_property(VALUE_SERIALIZER);
        }
        self.configure_serializers(resolved.configure_defaults)
    }

    /// ProducerFactory を構築する。
    pub fn build(self) -> Result<ProducerFactory, BinderError> {
        let key_serializer = effective(
            self.key_serializer,
            &self.properties,
            KEY_SERIALIZER,
            CodecSlot::KeySerializer,
            builtin_serializer,
        )?;
        let value_serializer = effective(
            self.value_serializer,
            &self.properties,
            VALUE_SERIALIZER,
            CodecSlot::ValueSerializer,
            builtin_serializer,
        )?;
        Ok(ProducerFactory {
            properties: self.properties,
            key_serializer,
            value_serializer,
            configure_serializers: self.configure_serializers,
        })
    }
}

/// ConsumerFactory はコンシューマークライアントの生成に必要な設定と解決済みデシリアライザーを保持する。
/// 同じ設定名を参照する全エンドポイントで共有される。
pub struct ConsumerFactory {
    properties: BTreeMap<String, String>,
    key_deserializer: Arc<dyn Deserializer>,
    value_deserializer: Arc<dyn Deserializer>,
    configure_deserializers: bool,
}

impl ConsumerFactory {
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn key_deserializer(&self) -> &Arc<dyn Deserializer> {
        &self.key_deserializer
    }

    pub fn value_deserializer(&self) -> &Arc<dyn Deserializer> {
        &self.value_deserializer
    }

    /// クラス指定のデシリアライザー設定を有効にするかどうか。
    ///
    /// configures_serializers と同じく、BrokerClient 実装向けの情報。
    pub fn configures_deserializers(&self) -> bool {
        self.configure_deserializers
    }
}

impl std::fmt::Debug for ConsumerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerFactory")
            .field("properties", &self.properties)
            .field("configure_deserializers", &self.configure_deserializers)
            .finish_non_exhaustive()
    }
}

/// ConsumerFactoryBuilder は ConsumerFactory のビルダー。
pub struct ConsumerFactoryBuilder {
    properties: BTreeMap<String, String>,
    key_deserializer: Option<Arc<dyn Deserializer>>,
    value_deserializer: Option<Arc<dyn Deserializer>>,
    configure_deserializers: bool,
}

impl Default for ConsumerFactoryBuilder {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            key_deserializer: None,
            value_deserializer: None,
            configure_deserializers: true,
        }
    }
}

impl ConsumerFactoryBuilder {
    pub fn empty() -> Self {
        Self::default()
    }

    /// コンシューマー設定で埋めたビルダーを返す。
    pub fn of(config: &ConsumerConfig) -> Self {
        let mut builder = Self::empty()
            .config(|props| {
                props.extend(config.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            })
            .property(BOOTSTRAP_SERVERS, &config.bootstrap_servers_string())
            .property(GROUP_ID, &config.group_id);

        if !config.key_deserializer.is_empty() {
            builder = builder.property(KEY_DESERIALIZER, &config.key_deserializer);
        }
        if !config.value_deserializer.is_empty() {
            builder = builder.property(VALUE_DESERIALIZER, &config.value_deserializer);
        }
        builder
    }

    pub fn property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }

    pub fn remove_property(mut self, name: &str) -> Self {
        self.properties.remove(name);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Self {
        f(&mut self.properties);
        self
    }

    pub fn key_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.key_deserializer = Some(deserializer);
        self
    }

    pub fn value_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.value_deserializer = Some(deserializer);
        self
    }

    pub fn configure_deserializers(mut self, configure: bool) -> Self {
        self.configure_deserializers = configure;
        self
    }

    /// 解決済みコーデックを適用する。上書きされたスロットのクラス指定は取り除く。
    pub fn with_resolved(mut self, resolved: ResolvedCodecs<dyn Deserializer>) -> Self {
        if let Some(key) = resolved.key {
            self = self.key_deserializer(key).remove_property(KEY_DESERIALIZER);
        }
        if let Some(value) = resolved.value {
            self = self.value_deserializer(value).remove_property(VALUE_DESERIALIZER);
        }
        self.configure_deserializers(resolved.configure_defaults)
    }

    pub fn build(self) -> Result<ConsumerFactory, BinderError> {
        let key_deserializer = effective(
            self.key_deserializer,
            &self.properties,
            KEY_DESERIALIZER,
            CodecSlot::KeyDeserializer,
            builtin_deserializer,
        )?;
        let value_deserializer = effective(
            self.value_deserializer,
            &self.properties,
            VALUE_DESERIALIZER,
            CodecSlot::ValueDeserializer,
            builtin_deserializer,
        )?;
        Ok(ConsumerFactory {
            properties: self.properties,
            key_deserializer,
            value_deserializer,
            configure_deserializers: self.configure_deserializers,
        })
    }
}

/// スロットの実効コーデックを決める。インスタンス指定があればそれを、なければクラス指定を使う。
fn effective<C: ?Sized>(
    instance: Option<Arc<C>>,
    properties: &BTreeMap<String, String>,
    property: &str,
    slot: CodecSlot,
    builtin: fn(&str) -> Option<Arc<C>>,
) -> Result<Arc<C>, BinderError> {
    if let Some(instance) = instance {
        return Ok(instance);
    }
    let class = properties.get(property).map_or("", String::as_str);
    builtin(class).ok_or_else(|| BinderError::CodecResolution {
        slot,
        name: class.to_string(),
    })
}
