use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k1s0_kafka_binder::codec::JsonCodec;
use k1s0_kafka_binder::{
    BinderError, BrokerClient, CodecComponents, ComponentRegistry, ConsumerBindingState,
    ConsumerClient, ConsumerConfig, ConsumerFactory, ConsumerRecord, Deserializer, Endpoint,
    EndpointDeclaration, InMemoryBroker, KafkaBinder, KafkaBinderConfig, MessageListener,
    ProducerClient, ProducerConfig, ProducerEndpoint, ProducerFactory, SendHandle, SendHandleSlot,
    Serializer,
};

#[derive(Default)]
struct OrderProducer {
    slot: SendHandleSlot,
}

impl ProducerEndpoint for OrderProducer {
    fn set_send_handle(&self, handle: SendHandle) -> Result<(), BinderError> {
        self.slot.inject(handle)
    }
}

impl Endpoint for OrderProducer {
    fn as_producer(&self) -> Option<&dyn ProducerEndpoint> {
        Some(self)
    }
}

#[derive(Default)]
struct OrderListener {
    received: Mutex<Vec<ConsumerRecord>>,
}

#[async_trait::async_trait]
impl MessageListener for OrderListener {
    async fn on_message(&self, record: ConsumerRecord) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(record);
        Ok(())
    }
}

impl Endpoint for OrderListener {
    fn as_listener(self: Arc<Self>) -> Option<Arc<dyn MessageListener>> {
        Some(self)
    }
}

impl OrderListener {
    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

/// ファクトリのプロパティを記録しながら InMemoryBroker に委譲するクライアント。
#[derive(Default)]
struct RecordingClient {
    inner: InMemoryBroker,
    producer_properties: Mutex<Vec<BTreeMap<String, String>>>,
}

impl BrokerClient for RecordingClient {
    fn create_producer(
        &self,
        factory: &ProducerFactory,
    ) -> Result<Arc<dyn ProducerClient>, BinderError> {
        self.producer_properties
            .lock()
            .unwrap()
            .push(factory.properties().clone());
        self.inner.create_producer(factory)
    }

    fn create_consumer(
        &self,
        factory: &ConsumerFactory,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn ConsumerClient>, BinderError> {
        self.inner.create_consumer(factory, topic, group_id)
    }
}

/// デシリアライザーの参照回数を数えるコンポーネントレジストリ。
#[derive(Default)]
struct CountingComponents {
    deserializer_lookups: AtomicUsize,
}

impl ComponentRegistry for CountingComponents {
    fn serializer(&self, _name: &str) -> Option<Arc<dyn Serializer>> {
        None
    }

    fn deserializer(&self, _name: &str) -> Option<Arc<dyn Deserializer>> {
        self.deserializer_lookups.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(JsonCodec))
    }
}

fn brokers() -> Vec<String> {
    vec!["memory:0".to_string()]
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_scenario_a_shared_factory_two_containers() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = KafkaBinderConfig::new()
        .with_consumer("orders", ConsumerConfig::new("orders", "g1", brokers()));
    let binder = KafkaBinder::from_config(config, Arc::new(CodecComponents::new()), broker.clone());

    let declarations = vec![
        EndpointDeclaration::consumer("C1", "orders", Arc::new(OrderListener::default())),
        EndpointDeclaration::consumer("C2", "orders", Arc::new(OrderListener::default())),
    ];
    binder.bind_all(&declarations).await.unwrap();

    assert_eq!(binder.tracker().len(), 2);
    assert!(binder.tracker().contains("C1"));
    assert!(binder.tracker().contains("C2"));
    assert_eq!(binder.consumer_binder().factory_cache_len(), 1);
    assert!(binder.consumer_binder().container_factory("orders").is_some());
    assert_eq!(broker.active_members("orders", "g1"), 2);

    binder.shutdown().await;
    assert_eq!(broker.active_members("orders", "g1"), 0);
}

#[tokio::test]
async fn test_scenario_b_send_targets_default_topic() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = KafkaBinderConfig::new()
        .with_producer("orders", ProducerConfig::new("orders", brokers()));
    let binder = KafkaBinder::from_config(config, Arc::new(CodecComponents::new()), broker.clone());

    let producer = Arc::new(OrderProducer::default());
    binder
        .bind_all(&[EndpointDeclaration::producer("P", "orders", producer.clone())])
        .await
        .unwrap();

    producer.slot.send_keyed("k", "v").await.unwrap();

    let sent = broker.sent_records();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "orders");
    assert_eq!(sent[0].key.as_deref(), Some(b"k".as_slice()));
    assert_eq!(sent[0].payload, br#""v""#.to_vec());
    assert_eq!(sent[0].partition, None);
}

#[tokio::test]
async fn test_scenario_c_value_override_removes_value_class_only() {
    let client = Arc::new(RecordingClient::default());
    let config = KafkaBinderConfig::new().with_producer(
        "audit",
        ProducerConfig::new("audit", brokers()).value_serializer_component("customAuditSerializer"),
    );
    let components =
        CodecComponents::new().with_serializer("customAuditSerializer", Arc::new(JsonCodec));
    let binder = KafkaBinder::from_config(config, Arc::new(components), client.clone());

    binder
        .bind_all(&[EndpointDeclaration::producer(
            "audit-producer",
            "audit",
            Arc::new(OrderProducer::default()),
        )])
        .await
        .unwrap();

    let properties = client.producer_properties.lock().unwrap();
    assert_eq!(properties.len(), 1);
    assert_eq!(
        properties[0].get("key.serializer").map(String::as_str),
        Some("string")
    );
    assert!(!properties[0].contains_key("value.serializer"));
}

#[tokio::test]
async fn test_missing_codec_component_is_fatal() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = KafkaBinderConfig::new().with_producer(
        "audit",
        ProducerConfig::new("audit", brokers()).value_serializer_component("customAuditSerializer"),
    );
    let binder = KafkaBinder::from_config(config, Arc::new(CodecComponents::new()), broker.clone());

    let err = binder
        .bind_all(&[EndpointDeclaration::producer(
            "audit-producer",
            "audit",
            Arc::new(OrderProducer::default()),
        )])
        .await
        .unwrap_err();
    assert!(matches!(err, BinderError::CodecResolution { ref name, .. } if name == "customAuditSerializer"));
    assert_eq!(broker.producers_created(), 0);
}

#[tokio::test]
async fn test_config_missing_constructs_nothing() {
    let broker = Arc::new(InMemoryBroker::new());
    let binder = KafkaBinder::from_config(
        KafkaBinderConfig::new(),
        Arc::new(CodecComponents::new()),
        broker.clone(),
    );

    let producer_err = binder
        .register_intent(&EndpointDeclaration::producer(
            "P",
            "nowhere",
            Arc::new(OrderProducer::default()),
        ))
        .unwrap_err();
    let consumer_err = binder
        .register_intent(&EndpointDeclaration::consumer(
            "C",
            "nowhere",
            Arc::new(OrderListener::default()),
        ))
        .unwrap_err();

    assert!(matches!(producer_err, BinderError::ConfigMissing { .. }));
    assert!(matches!(consumer_err, BinderError::ConfigMissing { .. }));
    assert_eq!(broker.producers_created(), 0);
    assert_eq!(binder.consumer_binder().factory_cache_len(), 0);
}

#[tokio::test]
async fn test_factory_constructed_once_for_many_endpoints() {
    let broker = Arc::new(InMemoryBroker::new());
    let components = Arc::new(CountingComponents::default());
    let config = KafkaBinderConfig::new().with_consumer(
        "audit",
        ConsumerConfig::new("audit", "g-audit", brokers())
            .value_deserializer_component("customAuditDeserializer"),
    );
    let binder = KafkaBinder::from_config(config, components.clone(), broker.clone());

    let declarations: Vec<EndpointDeclaration> = (0..5)
        .map(|i| {
            EndpointDeclaration::consumer(
                format!("audit-{i}"),
                "audit",
                Arc::new(OrderListener::default()),
            )
        })
        .collect();
    binder.bind_all(&declarations).await.unwrap();

    assert_eq!(components.deserializer_lookups.load(Ordering::SeqCst), 1);
    assert_eq!(binder.consumer_binder().factory_cache_len(), 1);
    assert_eq!(binder.tracker().len(), 5);
    assert_eq!(broker.consumers_created(), 5);

    binder.shutdown().await;
}

#[tokio::test]
async fn test_produce_then_consume_end_to_end() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = KafkaBinderConfig::from_yaml_str(
        r#"
producers:
  orders:
    topic: orders
    bootstrap_servers: ["memory:0"]
consumers:
  orders:
    topic: orders
    group_id: order-service
    bootstrap_servers: ["memory:0"]
"#,
    )
    .unwrap();
    let binder = KafkaBinder::from_config(config, Arc::new(CodecComponents::new()), broker.clone());

    let producer = Arc::new(OrderProducer::default());
    let listener = Arc::new(OrderListener::default());
    binder
        .bind_all(&[
            EndpointDeclaration::producer("order-producer", "orders", producer.clone()),
            EndpointDeclaration::consumer("order-listener", "orders", listener.clone()),
        ])
        .await
        .unwrap();

    for i in 0..3 {
        producer
            .slot
            .send_keyed(&format!("ord-{i}"), &serde_json::json!({"amount": i * 100}))
            .await
            .unwrap();
    }

    wait_until(|| listener.count() == 3).await;
    {
        let received = listener.received.lock().unwrap();
        assert_eq!(received.len(), 3);
        let offsets: Vec<i64> = received.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(received[2].key_str(), Some("ord-2"));
        assert_eq!(received[2].value["amount"], 200);
    }

    binder.shutdown().await;
    binder.shutdown().await;
    assert_eq!(
        binder.consumer_binder().state("order-listener"),
        Some(ConsumerBindingState::ContainerStopped)
    );
    assert_eq!(broker.closed_consumers(), 1);
    assert_eq!(broker.active_members("orders", "order-service"), 0);
}

#[tokio::test]
async fn test_undecodable_record_is_skipped() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = KafkaBinderConfig::new()
        .with_consumer("orders", ConsumerConfig::new("orders", "g1", brokers()));
    let binder = KafkaBinder::from_config(config, Arc::new(CodecComponents::new()), broker.clone());
    let listener = Arc::new(OrderListener::default());
    binder
        .bind_all(&[EndpointDeclaration::consumer("C1", "orders", listener.clone())])
        .await
        .unwrap();

    broker.publish("orders", None, b"{not json");
    broker.publish("orders", None, br#"{"ok":true}"#);

    wait_until(|| listener.count() == 1).await;
    assert_eq!(listener.received.lock().unwrap()[0].offset, 1);

    binder.shutdown().await;
}
