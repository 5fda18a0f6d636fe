mod de;
mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
    error::ChatError,
    types::{Result, SnapshotCallback, Unsubscribe},
};

pub(crate) use de::{lenient_id_set, lenient_timestamp};
pub use memory::MemoryStore;

pub type Fields = Map<String, Value>;

const SERVER_VALUE_KEY: &str = ".sv";
const SERVER_TIMESTAMP_VALUE: &str = "timestamp";

/// Placeholder resolved to the store's clock when the write is committed.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: SERVER_TIMESTAMP_VALUE })
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|object| object.get(SERVER_VALUE_KEY))
        .and_then(Value::as_str)
        == Some(SERVER_TIMESTAMP_VALUE)
}

/// Non-object values yield an empty field set.
pub fn to_fields(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}

/// Deletes a document owned by this client, logging and discarding failures.
pub(crate) async fn delete_best_effort(store: &dyn RealtimeStore, collection: &str, id: &str) {
    if let Err(error) = store.delete_document(collection, id).await {
        debug!("store: best-effort delete of {collection}/{id} failed: {error}");
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: &str, fields: Fields) -> Self {
        Self {
            id: String::from(id),
            fields,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionQuery {
    pub collection: String,
    pub order_by: Option<OrderBy>,
}

impl CollectionQuery {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: String::from(collection),
            order_by: None,
        }
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: String::from(field),
            direction,
        });
        self
    }
}

/// Pushes the full ordered collection to `on_snapshot` once on subscribe and
/// again after every change.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn subscribe_collection(
        &self,
        query: CollectionQuery,
        on_snapshot: SnapshotCallback,
    ) -> Result<Unsubscribe>;

    async fn upsert_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    async fn append_document(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Merges `fields` into an existing document. Fails if the document is absent.
    async fn update_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Deleting an absent document succeeds.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<()>;

    /// Atomically adds `values` to the array stored under `field`, skipping
    /// values already present.
    async fn array_union(
        &self,
        _collection: &str,
        _id: &str,
        _field: &str,
        _values: Vec<Value>,
    ) -> Result<()> {
        Err(ChatError::Unsupported {
            operation: "array_union",
        })
    }

    fn supports_array_union(&self) -> bool {
        false
    }
}
