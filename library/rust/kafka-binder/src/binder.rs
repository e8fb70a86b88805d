//! KafkaBinder: composition root から呼ばれるバインダーの入口。
//!
//! プロデューサーは register_intent の時点で送信ハンドルを注入し終える。
//! コンシューマーは register_intent でファクトリまでを用意し、
//! finalize_after_construction でコンテナを起動する。

use std::sync::Arc;

use crate::client::BrokerClient;
use crate::codec::ComponentRegistry;
use crate::config::{ConfigurationRegistry, KafkaBinderConfig};
use crate::consumer::ConsumerBinder;
use crate::endpoint::{EndpointDeclaration, EndpointKind};
use crate::error::BinderError;
use crate::lifecycle::LifecycleTracker;
use crate::producer::ProducerBinder;
use crate::resolver::SerializationResolver;

/// KafkaBinder は ProducerBinder・ConsumerBinder・LifecycleTracker を1組所有する。
pub struct KafkaBinder {
    enabled: bool,
    producers: ProducerBinder,
    consumers: ConsumerBinder,
    tracker: Arc<LifecycleTracker>,
}

impl KafkaBinder {
    pub fn new(
        registry: Arc<dyn ConfigurationRegistry>,
        components: Arc<dyn ComponentRegistry>,
        client: Arc<dyn BrokerClient>,
    ) -> Self {
        let resolver = SerializationResolver::new(components);
        let tracker = Arc::new(LifecycleTracker::new());
        Self {
            enabled: true,
            producers: ProducerBinder::new(registry.clone(), resolver.clone(), client.clone()),
            consumers: ConsumerBinder::new(registry, resolver, client, tracker.clone()),
            tracker,
        }
    }

    /// 読み込み済みの設定から生成する。`enabled: false` の場合は何もバインドしない。
    pub fn from_config(
        config: KafkaBinderConfig,
        components: Arc<dyn ComponentRegistry>,
        client: Arc<dyn BrokerClient>,
    ) -> Self {
        let enabled = config.enabled;
        let mut binder = Self::new(Arc::new(config), components, client);
        binder.enabled = enabled;
        binder
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// エンドポイントの構築完了前に呼ぶ。
    pub fn register_intent(&self, declaration: &EndpointDeclaration) -> Result<(), BinderError> {
        if !self.enabled {
            tracing::warn!(
                endpoint = %declaration.identity,
                "kafka binder is disabled, endpoint not bound"
            );
            return Ok(());
        }
        match declaration.kind {
            EndpointKind::Producer => self.producers.bind(declaration),
            EndpointKind::Consumer => self.consumers.register_intent(declaration),
        }
    }

    /// エンドポイントの構築完了後に呼ぶ。コンテナを起動した場合 true を返す。
    pub fn finalize_after_construction(&self, identity: &str) -> Result<bool, BinderError> {
        if !self.enabled {
            return Ok(false);
        }
        self.consumers.finalize_after_construction(identity)
    }

    /// 全エンドポイントを2段階でバインドする。
    ///
    /// いずれかが失敗した場合、起動済みのコンテナを停止してからエラーを返す。
    pub async fn bind_all(&self, declarations: &[EndpointDeclaration]) -> Result<(), BinderError> {
        if let Err(e) = self.try_bind_all(declarations) {
            tracing::error!(error = %e, "kafka endpoint binding failed, stopping started containers");
            self.tracker.stop_all().await;
            return Err(e);
        }
        tracing::info!(
            endpoints = declarations.len(),
            containers = self.tracker.len(),
            "kafka endpoints bound"
        );
        Ok(())
    }

    fn try_bind_all(&self, declarations: &[EndpointDeclaration]) -> Result<(), BinderError> {
        for declaration in declarations {
            self.register_intent(declaration)?;
        }
        for declaration in declarations {
            if declaration.kind == EndpointKind::Consumer {
                self.finalize_after_construction(&declaration.identity)?;
            }
        }
        Ok(())
    }

    /// 全コンテナを停止し、ポーリングの終了を待つ。
    pub async fn shutdown(&self) {
        self.tracker.stop_all().await;
    }

    pub fn producer_binder(&self) -> &ProducerBinder {
        &self.producers
    }

    pub fn consumer_binder(&self) -> &ConsumerBinder {
        &self.consumers
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }
}
