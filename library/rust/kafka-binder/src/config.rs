use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{JSON_CODEC, STRING_CODEC};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// CodecSpec はキーまたは値のコーデック指定を表す。
/// ByComponent が指定された場合、同じスロットの ByClass は使われない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecSpec {
    /// 組み込みコーデック識別子（例: "string", "json"）
    ByClass(String),
    /// ComponentRegistry に登録されたコンポーネント名
    ByComponent(String),
}

impl CodecSpec {
    fn select(class: &str, component: Option<&String>) -> Self {
        match component {
            Some(name) => CodecSpec::ByComponent(name.clone()),
            None => CodecSpec::ByClass(class.to_string()),
        }
    }
}

/// ProducerConfig は名前付きプロデューサー設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// 設定名（マップのキーから設定される）
    #[serde(skip)]
    pub configuration_name: String,
    /// デフォルトの送信先トピック
    pub topic: String,
    /// Kafka ブローカーアドレスのリスト（順序を保持する）
    pub bootstrap_servers: Vec<String>,
    /// バッチサイズ（バイト）。デフォルト: 16KiB
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// linger.ms。デフォルト: 0
    #[serde(default)]
    pub linger_ms: u64,
    #[serde(default = "default_key_codec")]
    pub key_serializer: String,
    #[serde(default = "default_value_codec")]
    pub value_serializer: String,
    #[serde(default)]
    pub key_serializer_component: Option<String>,
    #[serde(default)]
    pub value_serializer_component: Option<String>,
    /// クライアントにそのまま渡す追加プロパティ（acks, retries 等）
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// ConsumerConfig は名前付きコンシューマー設定を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(skip)]
    pub configuration_name: String,
    /// 購読するトピック
    pub topic: String,
    /// コンシューマーグループ ID
    pub group_id: String,
    pub bootstrap_servers: Vec<String>,
    #[serde(default = "default_key_codec")]
    pub key_deserializer: String,
    #[serde(default = "default_value_codec")]
    pub value_deserializer: String,
    #[serde(default)]
    pub key_deserializer_component: Option<String>,
    #[serde(default)]
    pub value_deserializer_component: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_batch_size() -> u64 {
    16 * 1024
}

fn default_key_codec() -> String {
    STRING_CODEC.to_string()
}

fn default_value_codec() -> String {
    JSON_CODEC.to_string()
}

fn default_enabled() -> bool {
    true
}

impl ProducerConfig {
    /// デフォルト値で ProducerConfig を生成する。
    pub fn new(topic: impl Into<String>, bootstrap_servers: Vec<String>) -> Self {
        Self {
            configuration_name: String::new(),
            topic: topic.into(),
            bootstrap_servers,
            batch_size: default_batch_size(),
            linger_ms: 0,
            key_serializer: default_key_codec(),
            value_serializer: default_value_codec(),
            key_serializer_component: None,
            value_serializer_component: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn batch_size(mut self, bytes: u64) -> Self {
        self.batch_size = bytes;
        self
    }

    pub fn linger_ms(mut self, ms: u64) -> Self {
        self.linger_ms = ms;
        self
    }

    pub fn key_serializer(mut self, class: &str) -> Self {
        self.key_serializer = class.to_string();
        self
    }

    pub fn value_serializer(mut self, class: &str) -> Self {
        self.value_serializer = class.to_string();
        self
    }

    pub fn key_serializer_component(mut self, name: &str) -> Self {
        self.key_serializer_component = Some(name.to_string());
        self
    }

    pub fn value_serializer_component(mut self, name: &str) -> Self {
        self.value_serializer_component = Some(name.to_string());
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn key_codec(&self) -> CodecSpec {
        CodecSpec::select(&self.key_serializer, self.key_serializer_component.as_ref())
    }

    pub fn value_codec(&self) -> CodecSpec {
        CodecSpec::select(&self.value_serializer, self.value_serializer_component.as_ref())
    }

    /// ブローカーアドレスをカンマ区切り文字列で返す（bootstrap.servers 用）。
    pub fn bootstrap_servers_string(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

impl ConsumerConfig {
    /// デフォルト値で ConsumerConfig を生成する。
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        bootstrap_servers: Vec<String>,
    ) -> Self {
        Self {
            configuration_name: String::new(),
            topic: topic.into(),
            group_id: group_id.into(),
            bootstrap_servers,
            key_deserializer: default_key_codec(),
            value_deserializer: default_value_codec(),
            key_deserializer_component: None,
            value_deserializer_component: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn key_deserializer(mut self, class: &str) -> Self {
        self.key_deserializer = class.to_string();
        self
    }

    pub fn value_deserializer(mut self, class: &str) -> Self {
        self.value_deserializer = class.to_string();
        self
    }

    pub fn key_deserializer_component(mut self, name: &str) -> Self {
        self.key_deserializer_component = Some(name.to_string());
        self
    }

    pub fn value_deserializer_component(mut self, name: &str) -> Self {
        self.value_deserializer_component = Some(name.to_string());
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn key_codec(&self) -> CodecSpec {
        CodecSpec::select(&self.key_deserializer, self.key_deserializer_component.as_ref())
    }

    pub fn value_codec(&self) -> CodecSpec {
        CodecSpec::select(
            &self.value_deserializer,
            self.value_deserializer_component.as_ref(),
        )
    }

    pub fn bootstrap_servers_string(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

/// ConfigurationRegistry は設定名から Producer / Consumer 設定を引くためのインターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ConfigurationRegistry: Send + Sync {
    fn producer(&self, name: &str) -> Option<ProducerConfig>;
    fn consumer(&self, name: &str) -> Option<ConsumerConfig>;
}

/// KafkaBinderConfig はバインダー全体の設定（名前付きプロファイルの表）を表す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaBinderConfig {
    /// false の場合、バインダーは何もバインドしない
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub producers: HashMap<String, ProducerConfig>,
    #[serde(default)]
    pub consumers: HashMap<String, ConsumerConfig>,
}

impl Default for KafkaBinderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }
}

impl KafkaBinderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// プロデューサー設定を追加する（ビルダーパターン）。
    pub fn with_producer(mut self, name: &str, mut config: ProducerConfig) -> Self {
        config.configuration_name = name.to_string();
        self.producers.insert(name.to_string(), config);
        self
    }

    /// コンシューマー設定を追加する（ビルダーパターン）。
    pub fn with_consumer(mut self, name: &str, mut config: ConsumerConfig) -> Self {
        config.configuration_name = name.to_string();
        self.consumers.insert(name.to_string(), config);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// YAML 文字列から設定を読み込む。
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: KafkaBinderConfig = serde_yaml::from_str(yaml)?;
        Ok(config.with_assigned_names())
    }

    fn with_assigned_names(mut self) -> Self {
        for (name, producer) in &mut self.producers {
            producer.configuration_name.clone_from(name);
        }
        for (name, consumer) in &mut self.consumers {
            consumer.configuration_name.clone_from(name);
        }
        self
    }
}

impl ConfigurationRegistry for KafkaBinderConfig {
    fn producer(&self, name: &str) -> Option<ProducerConfig> {
        self.producers.get(name).cloned()
    }

    fn consumer(&self, name: &str) -> Option<ConsumerConfig> {
        self.consumers.get(name).cloned()
    }
}

/// YAML を読み込み KafkaBinderConfig を返す。
///
/// env_path があれば、そのプロファイル定義をベースに重ねる。マッピングはキーごとに再帰的に
/// 重ね、それ以外の値（リストを含む）は環境側の値で置き換える。
pub fn load(base_path: &str, env_path: Option<&str>) -> Result<KafkaBinderConfig, ConfigError> {
    let base = std::fs::read_to_string(base_path)?;

    let Some(env) = env_path else {
        return KafkaBinderConfig::from_yaml_str(&base);
    };

    let mut profiles: serde_yaml::Value = serde_yaml::from_str(&base)?;
    let env_profiles: serde_yaml::Value = serde_yaml::from_str(&std::fs::read_to_string(env)?)?;
    overlay_profiles(&mut profiles, env_profiles);
    let config: KafkaBinderConfig = serde_yaml::from_value(profiles)?;
    Ok(config.with_assigned_names())
}

fn overlay_profiles(target: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (target, overlay) {
        (serde_yaml::Value::Mapping(target_map), serde_yaml::Value::Mapping(entries)) => {
            for (key, value) in entries {
                match target_map.get_mut(&key) {
                    Some(existing) => overlay_profiles(existing, value),
                    None => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, overlay) => *target = overlay,
    }
}

/// 設定値のバリデーション。
pub fn validate(config: &KafkaBinderConfig) -> Result<(), ConfigError> {
    for (name, producer) in &config.producers {
        validate_common(&format!("producers.{name}"), &producer.topic, &producer.bootstrap_servers)?;
    }
    for (name, consumer) in &config.consumers {
        let path = format!("consumers.{name}");
        validate_common(&path, &consumer.topic, &consumer.bootstrap_servers)?;
        if consumer.group_id.is_empty() {
            return Err(ConfigError::Validation(format!("{path}.group_id is required")));
        }
    }
    Ok(())
}

fn validate_common(path: &str, topic: &str, servers: &[String]) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::Validation(format!("{path}.topic is required")));
    }
    if servers.is_empty() {
        return Err(ConfigError::Validation(format!(
            "{path}.bootstrap_servers must contain at least one broker"
        )));
    }
    if servers.iter().any(String::is_empty) {
        return Err(ConfigError::Validation(format!(
            "{path}.bootstrap_servers contains an empty broker address"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_CONFIG: &str = r#"
producers:
  orders:
    topic: orders
    bootstrap_servers: ["kafka-0:9092", "kafka-1:9092"]
consumers:
  orders:
    topic: orders
    group_id: g1
    bootstrap_servers: ["kafka-0:9092"]
"#;

    #[test]
    fn test_from_yaml_defaults() {
        let cfg = KafkaBinderConfig::from_yaml_str(MINIMAL_CONFIG).unwrap();
        assert!(cfg.enabled);

        let producer = cfg.producer("orders").unwrap();
        assert_eq!(producer.configuration_name, "orders");
        assert_eq!(producer.batch_size, 16384);
        assert_eq!(producer.linger_ms, 0);
        assert_eq!(producer.key_codec(), CodecSpec::ByClass("string".to_string()));
        assert_eq!(producer.value_codec(), CodecSpec::ByClass("json".to_string()));
        assert_eq!(producer.bootstrap_servers_string(), "kafka-0:9092,kafka-1:9092");

        let consumer = cfg.consumer("orders").unwrap();
        assert_eq!(consumer.configuration_name, "orders");
        assert_eq!(consumer.group_id, "g1");
        assert!(consumer.properties.is_empty());
    }

    #[test]
    fn test_component_overrides_class() {
        let cfg = ProducerConfig::new("audit", vec!["kafka:9092".to_string()])
            .value_serializer_component("customAuditSerializer");
        assert_eq!(cfg.key_codec(), CodecSpec::ByClass("string".to_string()));
        assert_eq!(
            cfg.value_codec(),
            CodecSpec::ByComponent("customAuditSerializer".to_string())
        );
    }

    #[test]
    fn test_lookup_is_kind_specific() {
        let cfg = KafkaBinderConfig::new().with_consumer(
            "payments",
            ConsumerConfig::new("payments", "g1", vec!["kafka:9092".to_string()]),
        );
        assert!(cfg.consumer("payments").is_some());
        assert!(cfg.producer("payments").is_none());
    }

    #[test]
    fn test_disabled_flag() {
        let cfg = KafkaBinderConfig::from_yaml_str("enabled: false").unwrap();
        assert!(!cfg.enabled);
        assert!(cfg.producers.is_empty());
    }

    #[test]
    fn test_load_with_env_override() {
        let mut base = NamedTempFile::new().unwrap();
        write!(base, "{MINIMAL_CONFIG}").unwrap();

        let mut env = NamedTempFile::new().unwrap();
        write!(
            env,
            r#"
producers:
  orders:
    linger_ms: 5
    properties:
      acks: all
"#
        )
        .unwrap();

        let cfg = load(
            base.path().to_str().unwrap(),
            Some(env.path().to_str().unwrap()),
        )
        .unwrap();
        let producer = cfg.producer("orders").unwrap();
        assert_eq!(producer.linger_ms, 5);
        assert_eq!(producer.properties.get("acks").map(String::as_str), Some("all"));
        assert_eq!(producer.topic, "orders"); // base value preserved
        assert_eq!(producer.configuration_name, "orders");
    }

    #[test]
    fn test_env_overlay_adds_profile_and_replaces_brokers() {
        let mut base = NamedTempFile::new().unwrap();
        write!(base, "{MINIMAL_CONFIG}").unwrap();

        let mut env = NamedTempFile::new().unwrap();
        write!(
            env,
            r#"
consumers:
  orders:
    bootstrap_servers: ["kafka-prod:9092"]
  audit:
    topic: audit
    group_id: g-audit
    bootstrap_servers: ["kafka-prod:9092"]
"#
        )
        .unwrap();

        let cfg = load(
            base.path().to_str().unwrap(),
            Some(env.path().to_str().unwrap()),
        )
        .unwrap();
        let orders = cfg.consumer("orders").unwrap();
        assert_eq!(orders.bootstrap_servers, vec!["kafka-prod:9092".to_string()]);
        assert_eq!(orders.group_id, "g1");
        let audit = cfg.consumer("audit").unwrap();
        assert_eq!(audit.configuration_name, "audit");
        assert_eq!(audit.group_id, "g-audit");
    }

    #[test]
    fn test_load_file_not_found() {
        let err = load("/nonexistent/kafka.yaml", None).unwrap_err();
        assert!(err.to_string().contains("failed to read file"));
    }

    #[test]
    fn test_validate_ok() {
        let cfg = KafkaBinderConfig::from_yaml_str(MINIMAL_CONFIG).unwrap();
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_validate_empty_group_id() {
        let cfg = KafkaBinderConfig::new().with_consumer(
            "orders",
            ConsumerConfig::new("orders", "", vec!["kafka:9092".to_string()]),
        );
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("consumers.orders.group_id"));
    }

    #[test]
    fn test_validate_empty_broker() {
        let cfg = KafkaBinderConfig::new()
            .with_producer("orders", ProducerConfig::new("orders", vec![String::new()]));
        assert!(matches!(validate(&cfg), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_no_brokers() {
        let cfg = KafkaBinderConfig::new()
            .with_producer("orders", ProducerConfig::new("orders", vec![]));
        assert!(matches!(validate(&cfg), Err(ConfigError::Validation(_))));
    }
}
