use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use crate::container::MessageListenerContainer;
use crate::error::BinderError;

#[derive(Default)]
struct TrackerState {
    containers: HashMap<String, MessageListenerContainer>,
    stopped: HashSet<String>,
    shut_down: bool,
}

/// LifecycleTracker は起動済みコンテナをエンドポイント識別子ごとに保持し、
/// シャットダウン時に一括で停止する。
#[derive(Default)]
pub struct LifecycleTracker {
    state: Mutex<TrackerState>,
    // 並行する stop_all 呼び出しは全て最初の停止処理の完了を待つ
    shutdown: OnceCell<()>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 起動済みコンテナを登録する。
    ///
    /// 同じ識別子が登録済みの場合、または stop_all 後の場合はエラーを返す。
    /// その際、渡されたコンテナは破棄され、ポーリングタスクはキャンセルされる。
    pub fn register(
        &self,
        identity: impl Into<String>,
        container: MessageListenerContainer,
    ) -> Result<(), BinderError> {
        let identity = identity.into();
        let mut state = self.state();
        if state.shut_down {
            return Err(BinderError::ShutDown);
        }
        if state.containers.contains_key(&identity) || state.stopped.contains(&identity) {
            return Err(BinderError::DuplicateEndpoint(identity));
        }
        state.containers.insert(identity, container);
        Ok(())
    }

    /// 登録済みの全コンテナを停止し、全ポーリングタスクの終了を待つ。
    ///
    /// 停止処理は1回だけ実行される。並行して呼ばれた場合も、停止が完了するまで戻らない。
    pub async fn stop_all(&self) {
        self.shutdown.get_or_init(|| self.stop_tracked()).await;
    }

    async fn stop_tracked(&self) {
        let containers: Vec<(String, MessageListenerContainer)> = {
            let mut state = self.state();
            state.shut_down = true;
            state.containers.drain().collect()
        };
        if containers.is_empty() {
            return;
        }

        let count = containers.len();
        let stopped = futures::future::join_all(containers.into_iter().map(
            |(identity, mut container)| async move {
                container.stop().await;
                identity
            },
        ))
        .await;

        self.state().stopped.extend(stopped);
        tracing::info!(count, "all kafka listener containers stopped");
    }

    /// 停止前のコンテナ数を返す。
    pub fn len(&self) -> usize {
        self.state().containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().containers.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.state().containers.contains_key(identity)
    }

    /// stop_all によって停止されたかどうか。
    pub fn is_stopped(&self, identity: &str) -> bool {
        self.state().stopped.contains(identity)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::codec::CodecComponents;
    use crate::config::ConsumerConfig;
    use crate::container::ContainerFactory;
    use crate::endpoint::{ConsumerRecord, MessageListener};
    use crate::factory::ConsumerFactoryBuilder;
    use crate::memory::InMemoryBroker;
    use crate::resolver::SerializationResolver;

    struct Noop;

    #[async_trait::async_trait]
    impl MessageListener for Noop {
        async fn on_message(&self, _record: ConsumerRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct SlowListener {
        started: AtomicBool,
        finished: AtomicBool,
    }

    #[async_trait::async_trait]
    impl MessageListener for SlowListener {
        async fn on_message(&self, _record: ConsumerRecord) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn started_container(broker: &Arc<InMemoryBroker>, endpoint: &str) -> MessageListenerContainer {
        started_with(broker, endpoint, Arc::new(Noop))
    }

    fn started_with(
        broker: &Arc<InMemoryBroker>,
        endpoint: &str,
        listener: Arc<dyn MessageListener>,
    ) -> MessageListenerContainer {
        let config = ConsumerConfig::new("orders", "g1", vec!["memory:0".to_string()]);
        let resolver = SerializationResolver::new(Arc::new(CodecComponents::new()));
        let resolved = resolver
            .resolve_deserializers(&config.key_codec(), &config.value_codec())
            .unwrap();
        let factory = ContainerFactory::new(
            "orders",
            ConsumerFactoryBuilder::of(&config)
                .with_resolved(resolved)
                .build()
                .unwrap(),
            broker.clone(),
        );
        let mut container = factory.create_container(endpoint, "orders");
        container.set_listener(listener);
        container.start().unwrap();
        container
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let tracker = LifecycleTracker::new();
        tracker.register("c1", started_container(&broker, "c1")).unwrap();
        tracker.register("c2", started_container(&broker, "c2")).unwrap();
        assert_eq!(tracker.len(), 2);
        assert_eq!(broker.active_members("orders", "g1"), 2);

        tracker.stop_all().await;
        tracker.stop_all().await;

        assert!(tracker.is_empty());
        assert!(tracker.is_stopped("c1"));
        assert!(tracker.is_stopped("c2"));
        assert_eq!(broker.active_members("orders", "g1"), 0);
        // close は各コンテナで1回だけ
        assert_eq!(broker.closed_consumers(), 2);
    }

    #[tokio::test]
    async fn test_register_duplicate_identity() {
        let broker = Arc::new(InMemoryBroker::new());
        let tracker = LifecycleTracker::new();
        tracker.register("c1", started_container(&broker, "c1")).unwrap();
        let err = tracker
            .register("c1", started_container(&broker, "c1"))
            .unwrap_err();
        assert!(matches!(err, BinderError::DuplicateEndpoint(ref id) if id == "c1"));
        assert_eq!(tracker.len(), 1);
        tracker.stop_all().await;
    }

    #[tokio::test]
    async fn test_register_after_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let tracker = LifecycleTracker::new();
        tracker.stop_all().await;
        assert!(tracker.is_shut_down());
        let err = tracker
            .register("c1", started_container(&broker, "c1"))
            .unwrap_err();
        assert!(matches!(err, BinderError::ShutDown));
    }

    #[tokio::test]
    async fn test_concurrent_stop_all_waits_for_in_flight_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        let tracker = Arc::new(LifecycleTracker::new());
        let listener = Arc::new(SlowListener::default());
        tracker
            .register("slow", started_with(&broker, "slow", listener.clone()))
            .unwrap();

        broker.publish("orders", None, b"{}");
        for _ in 0..100 {
            if listener.started.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(listener.started.load(Ordering::SeqCst));

        let first = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.stop_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 先行する停止処理が実行中でも、ハンドラーの完了まで戻らない
        tracker.stop_all().await;
        assert!(listener.finished.load(Ordering::SeqCst));
        assert!(tracker.is_stopped("slow"));
        assert_eq!(broker.active_members("orders", "g1"), 0);

        first.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_register_from_threads() {
        let broker = Arc::new(InMemoryBroker::new());
        let tracker = LifecycleTracker::new();
        let distinct: Vec<(String, MessageListenerContainer)> = (0..8)
            .map(|i| {
                let identity = format!("c{i}");
                let container = started_container(&broker, &identity);
                (identity, container)
            })
            .collect();
        let duplicates: Vec<MessageListenerContainer> =
            (0..4).map(|_| started_container(&broker, "dup")).collect();

        let results: Vec<Result<(), BinderError>> = std::thread::scope(|s| {
            let tracker = &tracker;
            let handles: Vec<_> = distinct
                .into_iter()
                .map(|(identity, container)| s.spawn(move || tracker.register(identity, container)))
                .chain(
                    duplicates
                        .into_iter()
                        .map(|container| s.spawn(move || tracker.register("dup", container))),
                )
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 9);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(BinderError::DuplicateEndpoint(id)) if id == "dup"))
                .count(),
            3
        );
        assert_eq!(tracker.len(), 9);
        assert!(tracker.contains("dup"));

        tracker.stop_all().await;
        assert!(tracker.is_empty());
    }
}
