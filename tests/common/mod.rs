#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::watch, time::timeout};
use tracing_subscriber::EnvFilter;

use realtime_chat_rs::{
    ChatConfig, ChatError, ChatSession, IdentityProvider, MemoryStore, RealtimeStore,
    config::IdentityConfig,
    storage::{KeyValueStorage, MemoryStorage},
    store::{CollectionQuery, Fields},
    types::{Result, SnapshotCallback, Unsubscribe},
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn create_provider() -> Arc<IdentityProvider> {
    create_provider_with(Arc::new(MemoryStorage::new()))
}

pub fn create_provider_with(storage: Arc<dyn KeyValueStorage>) -> Arc<IdentityProvider> {
    Arc::new(IdentityProvider::new(storage, IdentityConfig::default()))
}

pub async fn connect(store: Arc<dyn RealtimeStore>) -> ChatSession {
    ChatSession::connect(store, create_provider(), ChatConfig::default())
        .await
        .expect("Error while connecting chat session.")
}

/// Lets every spawned task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub async fn wait_until<T, F>(receiver: &mut watch::Receiver<T>, predicate: F)
where
    F: FnMut(&T) -> bool,
{
    timeout(WAIT, receiver.wait_for(predicate))
        .await
        .expect("Timeout elapsed while waiting for state.")
        .expect("State sender dropped.");
}

/// Wraps a `MemoryStore` with switchable failures.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    atomic_union: bool,
    fail_appends: AtomicBool,
    fail_updates: AtomicBool,
    fail_subscribe_to: Option<String>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            atomic_union: true,
            fail_appends: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_subscribe_to: None,
        }
    }

    /// Hides `array_union`, forcing read-modify-write receipts.
    pub fn without_atomic_union(mut self) -> Self {
        self.atomic_union = false;
        self
    }

    pub fn failing_subscription(mut self, collection: &str) -> Self {
        self.fail_subscribe_to = Some(String::from(collection));
        self
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn rejected(operation: &'static str, collection: &str) -> ChatError {
        ChatError::store(operation, collection, "network unreachable")
    }
}

#[async_trait]
impl RealtimeStore for FaultyStore {
    async fn subscribe_collection(
        &self,
        query: CollectionQuery,
        on_snapshot: SnapshotCallback,
    ) -> Result<Unsubscribe> {
        if self.fail_subscribe_to.as_deref() == Some(query.collection.as_str()) {
            return Err(Self::rejected("subscribe", &query.collection));
        }
        self.inner.subscribe_collection(query, on_snapshot).await
    }

    async fn upsert_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.inner.upsert_document(collection, id, fields).await
    }

    async fn append_document(&self, collection: &str, fields: Fields) -> Result<String> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::rejected("append", collection));
        }
        self.inner.append_document(collection, fields).await
    }

    async fn update_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::rejected("update", collection));
        }
        self.inner.update_document(collection, id, fields).await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        self.inner.delete_document(collection, id).await
    }

    async fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::rejected("array_union", collection));
        }
        self.inner.array_union(collection, id, field, values).await
    }

    fn supports_array_union(&self) -> bool {
        self.atomic_union
    }
}
