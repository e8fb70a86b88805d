//! SerializationResolver: コーデック指定から実際のシリアライザー・デシリアライザーを解決する。
//!
//! キーと値のスロットは独立して解決される。ByComponent 指定のスロットはコンポーネントが
//! 優先され、そのスロットのクラス指定プロパティは factory 設定から取り除かれる。

use std::sync::Arc;

use crate::codec::{ComponentRegistry, Deserializer, Serializer};
use crate::config::CodecSpec;
use crate::error::{BinderError, CodecSlot};

/// ResolvedCodecs はコーデック解決結果を表す。
///
/// `key` / `value` が Some のスロットはコンポーネント指定で、クラス指定を上書きする。
/// `configure_defaults` は上書きされていないスロットのクラス指定を有効にするかどうか。
pub struct ResolvedCodecs<C: ?Sized> {
    pub key: Option<Arc<C>>,
    pub value: Option<Arc<C>>,
    pub configure_defaults: bool,
}

impl<C: ?Sized> ResolvedCodecs<C> {
    /// キーがコンポーネントで上書きされているか。
    pub fn key_overridden(&self) -> bool {
        self.key.is_some()
    }

    /// 値がコンポーネントで上書きされているか。
    pub fn value_overridden(&self) -> bool {
        self.value.is_some()
    }
}

/// SerializationResolver は ComponentRegistry を使ってコーデック指定を解決する。
#[derive(Clone)]
pub struct SerializationResolver {
    components: Arc<dyn ComponentRegistry>,
}

impl SerializationResolver {
    pub fn new(components: Arc<dyn ComponentRegistry>) -> Self {
        Self { components }
    }

    /// プロデューサー用のキー・値シリアライザーを解決する。
    pub fn resolve_serializers(
        &self,
        key: &CodecSpec,
        value: &CodecSpec,
    ) -> Result<ResolvedCodecs<dyn Serializer>, BinderError> {
        let key = resolve_slot(key, CodecSlot::KeySerializer, |name| {
            self.components.serializer(name)
        })?;
        let value = resolve_slot(value, CodecSlot::ValueSerializer, |name| {
            self.components.serializer(name)
        })?;
        Ok(finish(key, value))
    }

    /// コンシューマー用のキー・値デシリアライザーを解決する。
    pub fn resolve_deserializers(
        &self,
        key: &CodecSpec,
        value: &CodecSpec,
    ) -> Result<ResolvedCodecs<dyn Deserializer>, BinderError> {
        let key = resolve_slot(key, CodecSlot::KeyDeserializer, |name| {
            self.components.deserializer(name)
        })?;
        let value = resolve_slot(value, CodecSlot::ValueDeserializer, |name| {
            self.components.deserializer(name)
        })?;
        Ok(finish(key, value))
    }
}

fn resolve_slot<C: ?Sized>(
    spec: &CodecSpec,
    slot: CodecSlot,
    lookup: impl FnOnce(&str) -> Option<Arc<C>>,
) -> Result<Option<Arc<C>>, BinderError> {
    match spec {
        CodecSpec::ByClass(_) => Ok(None),
        CodecSpec::ByComponent(name) => {
            lookup(name)
                .map(Some)
                .ok_or_else(|| BinderError::CodecResolution {
                    slot,
                    name: name.clone(),
                })
        }
    }
}

fn finish<C: ?Sized>(key: Option<Arc<C>>, value: Option<Arc<C>>) -> ResolvedCodecs<C> {
    let configure_defaults = key.is_none() || value.is_none();
    ResolvedCodecs {
        key,
        value,
        configure_defaults,
    }
}
