//! ConsumerBinder: コンシューマーエンドポイントの2段階バインド。
//!
//! register_intent で設定解決とコンテナファクトリの取得までを行い、
//! finalize_after_construction でコンテナを起動して LifecycleTracker に登録する。
//! コンテナファクトリは設定名ごとに1つだけ構築され、以後は共有される。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::BrokerClient;
use crate::config::{ConfigurationRegistry, ConsumerConfig};
use crate::container::ContainerFactory;
use crate::endpoint::{EndpointDeclaration, MessageListener};
use crate::error::BinderError;
use crate::factory::ConsumerFactoryBuilder;
use crate::lifecycle::LifecycleTracker;
use crate::resolver::SerializationResolver;

/// ConsumerBindingState はコンシューマーエンドポイントのバインド状態を表す。
///
/// Discovered と ConfigResolved は register_intent の内部でのみ経由し、
/// 登録済みエンドポイントは FactoryReady 以降の状態を持つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerBindingState {
    Discovered,
    ConfigResolved,
    FactoryReady,
    ContainerStarted,
    ContainerStopped,
}

struct PendingEndpoint {
    topic: String,
    group_id: String,
    listener: Arc<dyn MessageListener>,
    factory: Arc<ContainerFactory>,
    state: ConsumerBindingState,
}

/// ConsumerBinder はコンシューマーエンドポイントごとにリスナーコンテナを構築・起動する。
pub struct ConsumerBinder {
    registry: Arc<dyn ConfigurationRegistry>,
    resolver: SerializationResolver,
    client: Arc<dyn BrokerClient>,
    factories: Mutex<HashMap<String, Arc<ContainerFactory>>>,
    endpoints: Mutex<HashMap<String, PendingEndpoint>>,
    tracker: Arc<LifecycleTracker>,
}

impl ConsumerBinder {
    pub fn new(
        registry: Arc<dyn ConfigurationRegistry>,
        resolver: SerializationResolver,
        client: Arc<dyn BrokerClient>,
        tracker: Arc<LifecycleTracker>,
    ) -> Self {
        Self {
            registry,
            resolver,
            client,
            factories: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            tracker,
        }
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, PendingEndpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn factories(&self) -> MutexGuard<'_, HashMap<String, Arc<ContainerFactory>>> {
        self.factories.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// エンドポイントの設定を解決し、コンテナファクトリを用意する。
    ///
    /// エンドポイントの構築が完了するまでコンテナは起動しない。
    pub fn register_intent(&self, declaration: &EndpointDeclaration) -> Result<(), BinderError> {
        let config = self
            .registry
            .consumer(&declaration.configuration_name)
            .ok_or_else(|| BinderError::ConfigMissing {
                endpoint: declaration.identity.clone(),
                configuration: declaration.configuration_name.clone(),
            })?;

        let listener = declaration.component.clone().as_listener().ok_or_else(|| {
            BinderError::TypeMismatch {
                endpoint: declaration.identity.clone(),
                expected: "MessageListener",
            }
        })?;

        if self.endpoints().contains_key(&declaration.identity) {
            return Err(BinderError::DuplicateEndpoint(declaration.identity.clone()));
        }

        let factory = self.container_factory_for(&declaration.configuration_name, &config)?;

        let mut endpoints = self.endpoints();
        if endpoints.contains_key(&declaration.identity) {
            return Err(BinderError::DuplicateEndpoint(declaration.identity.clone()));
        }
        endpoints.insert(
            declaration.identity.clone(),
            PendingEndpoint {
                topic: config.topic.clone(),
                group_id: config.group_id.clone(),
                listener,
                factory,
                state: ConsumerBindingState::FactoryReady,
            },
        );

        tracing::debug!(
            endpoint = %declaration.identity,
            configuration = %declaration.configuration_name,
            "kafka consumer endpoint registered"
        );
        Ok(())
    }

    // ロックを保持したまま構築するため、同じ設定名の初回参照が並行しても構築は1回
    fn container_factory_for(
        &self,
        configuration_name: &str,
        config: &ConsumerConfig,
    ) -> Result<Arc<ContainerFactory>, BinderError> {
        let mut factories = self.factories();
        if let Some(existing) = factories.get(configuration_name) {
            tracing::debug!(configuration = %configuration_name, "reusing kafka container factory");
            return Ok(existing.clone());
        }

        let resolved = self
            .resolver
            .resolve_deserializers(&config.key_codec(), &config.value_codec())?;
        let consumer_factory = ConsumerFactoryBuilder::of(config)
            .with_resolved(resolved)
            .build()?;
        let factory = Arc::new(ContainerFactory::new(
            configuration_name,
            consumer_factory,
            self.client.clone(),
        ));
        factories.insert(configuration_name.to_string(), factory.clone());

        tracing::info!(
            configuration = %configuration_name,
            topic = %config.topic,
            group = %config.group_id,
            "kafka container factory created"
        );
        Ok(factory)
    }

    /// 構築が完了したエンドポイントのコンテナを起動し、LifecycleTracker に登録する。
    ///
    /// 未登録または起動済みの識別子に対しては何もせず Ok(false) を返す。
    pub fn finalize_after_construction(&self, identity: &str) -> Result<bool, BinderError> {
        let (topic, group_id, listener, factory) = {
            let mut endpoints = self.endpoints();
            let Some(pending) = endpoints.get_mut(identity) else {
                return Ok(false);
            };
            if pending.state != ConsumerBindingState::FactoryReady {
                return Ok(false);
            }
            if self.tracker.is_shut_down() {
                return Err(BinderError::ShutDown);
            }
            pending.state = ConsumerBindingState::ContainerStarted;
            (
                pending.topic.clone(),
                pending.group_id.clone(),
                pending.listener.clone(),
                pending.factory.clone(),
            )
        };

        let started = (|| {
            let mut container = factory.create_container(identity, &topic);
            container.set_group_id(group_id);
            container.set_listener(listener);
            container.start()?;
            self.tracker.register(identity, container)
        })();

        if let Err(e) = started {
            if let Some(pending) = self.endpoints().get_mut(identity) {
                pending.state = ConsumerBindingState::FactoryReady;
            }
            return Err(e);
        }
        Ok(true)
    }

    /// 登録済みエンドポイントの現在の状態を返す。
    pub fn state(&self, identity: &str) -> Option<ConsumerBindingState> {
        let state = self.endpoints().get(identity)?.state;
        if state == ConsumerBindingState::ContainerStarted && self.tracker.is_stopped(identity) {
            return Some(ConsumerBindingState::ContainerStopped);
        }
        Some(state)
    }

    /// 登録済みで未起動のエンドポイント識別子。
    pub fn pending_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .endpoints()
            .iter()
            .filter(|(_, pending)| pending.state == ConsumerBindingState::FactoryReady)
            .map(|(identity, _)| identity.clone())
            .collect();
        identities.sort();
        identities
    }

    pub fn factory_cache_len(&self) -> usize {
        self.factories().len()
    }

    pub fn container_factory(&self, configuration_name: &str) -> Option<Arc<ContainerFactory>> {
        self.factories().get(configuration_name).cloned()
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }
}
