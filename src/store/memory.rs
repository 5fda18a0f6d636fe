use std::{
    cmp::Ordering as CmpOrdering,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rand::{Rng, distr::Alphanumeric};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CollectionQuery, Direction, Document, Fields, RealtimeStore, is_server_timestamp};
use crate::{
    error::ChatError,
    types::{Result, SnapshotCallback, Unsubscribe},
};

const GENERATED_ID_LENGTH: usize = 20;

/// Snapshot callbacks run under the store lock: they must not block or call
/// back into the store.
#[derive(Default)]
pub struct MemoryStore {
    mutable_state: Mutex<MemoryStoreMutableState>,
}

#[derive(Default)]
struct MemoryStoreMutableState {
    collections: HashMap<String, HashMap<String, StoredDocument>>,
    subscribers: Vec<Subscriber>,
    next_sequence: u64,
}

struct StoredDocument {
    sequence: u64,
    fields: Fields,
}

struct Subscriber {
    query: CollectionQuery,
    callback: SnapshotCallback,
    active: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Document> {
        let state = self.mutable_state.lock().await;
        state
            .collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .map(|stored| Document::new(id, stored.fields.clone()))
    }

    /// Collection contents in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        let state = self.mutable_state.lock().await;
        state.snapshot(&CollectionQuery::new(collection))
    }

    pub async fn active_subscriptions(&self) -> usize {
        let state = self.mutable_state.lock().await;
        state
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.active.load(Ordering::SeqCst))
            .count()
    }

    fn generate_id() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_ID_LENGTH)
            .map(char::from)
            .collect()
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl MemoryStoreMutableState {
    fn make_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn snapshot(&self, query: &CollectionQuery) -> Vec<Document> {
        let Some(documents) = self.collections.get(&query.collection) else {
            return vec![];
        };

        let mut ordered: Vec<(&String, &StoredDocument)> = documents.iter().collect();
        ordered.sort_by_key(|(_, stored)| stored.sequence);

        if let Some(order_by) = &query.order_by {
            ordered.sort_by(|(_, a), (_, b)| {
                compare_field(
                    a.fields.get(&order_by.field),
                    b.fields.get(&order_by.field),
                    order_by.direction,
                )
            });
        }

        ordered
            .into_iter()
            .map(|(id, stored)| Document::new(id, stored.fields.clone()))
            .collect()
    }

    fn notify(&mut self, collection: &str) {
        self.subscribers
            .retain(|subscriber| subscriber.active.load(Ordering::SeqCst));

        for subscriber in &self.subscribers {
            if subscriber.query.collection == collection {
                (subscriber.callback)(self.snapshot(&subscriber.query));
            }
        }
    }

    fn merge(&mut self, collection: &str, id: &str, fields: Fields) {
        let sequence = self.make_sequence();
        let stored = self
            .collections
            .entry(String::from(collection))
            .or_default()
            .entry(String::from(id))
            .or_insert_with(|| StoredDocument {
                sequence,
                fields: Fields::new(),
            });

        stored.fields.extend(resolve_server_values(fields));
    }

    fn existing_mut(&mut self, collection: &str, id: &str) -> Result<&mut StoredDocument> {
        self.collections
            .get_mut(collection)
            .and_then(|documents| documents.get_mut(id))
            .ok_or_else(|| ChatError::DocumentNotFound {
                collection: String::from(collection),
                id: String::from(id),
            })
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn subscribe_collection(
        &self,
        query: CollectionQuery,
        on_snapshot: SnapshotCallback,
    ) -> Result<Unsubscribe> {
        let mut state = self.mutable_state.lock().await;

        on_snapshot(state.snapshot(&query));

        let active = Arc::new(AtomicBool::new(true));
        debug!("memory store: subscribed to '{}'.", query.collection);
        state.subscribers.push(Subscriber {
            query,
            callback: on_snapshot,
            active: Arc::clone(&active),
        });

        Ok(Unsubscribe::new(move || {
            active.store(false, Ordering::SeqCst);
        }))
    }

    async fn upsert_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        let mut state = self.mutable_state.lock().await;
        state.merge(collection, id, fields);
        state.notify(collection);
        Ok(())
    }

    async fn append_document(&self, collection: &str, fields: Fields) -> Result<String> {
        let id = Self::generate_id();
        let mut state = self.mutable_state.lock().await;
        state.merge(collection, &id, fields);
        state.notify(collection);
        Ok(id)
    }

    async fn update_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        let mut state = self.mutable_state.lock().await;
        state
            .existing_mut(collection, id)?
            .fields
            .extend(resolve_server_values(fields));
        state.notify(collection);
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        let mut state = self.mutable_state.lock().await;
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.remove(id));

        if removed.is_some() {
            state.notify(collection);
        }
        Ok(())
    }

    async fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<()> {
        let mut state = self.mutable_state.lock().await;
        let stored = state.existing_mut(collection, id)?;

        let entry = stored
            .fields
            .entry(String::from(field))
            .or_insert_with(|| Value::Array(vec![]));
        if !entry.is_array() {
            *entry = Value::Array(vec![]);
        }

        let mut changed = false;
        if let Value::Array(existing) = entry {
            for value in values {
                if !existing.contains(&value) {
                    existing.push(value);
                    changed = true;
                }
            }
        }

        if changed {
            state.notify(collection);
        }
        Ok(())
    }

    fn supports_array_union(&self) -> bool {
        true
    }
}

fn resolve_server_values(fields: Fields) -> Fields {
    let now = MemoryStore::now();
    fields
        .into_iter()
        .map(|(key, value)| {
            if is_server_timestamp(&value) {
                (key, Value::String(now.clone()))
            } else {
                (key, value)
            }
        })
        .collect()
}

/// Documents lacking a comparable value sort after all others in either direction.
fn compare_field(a: Option<&Value>, b: Option<&Value>, direction: Direction) -> CmpOrdering {
    let a = a.filter(|value| is_comparable(value));
    let b = b.filter(|value| is_comparable(value));

    match (a, b) {
        (Some(a), Some(b)) => {
            let ordering = compare_values(a, b);
            match direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        }
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

fn is_comparable(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        _ => 2,
    }
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or_default();
            let b = b.as_f64().unwrap_or_default();
            a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;
    use crate::store::{server_timestamp, to_fields as fields};

    fn recording_callback() -> (SnapshotCallback, Arc<StdMutex<Vec<Vec<Document>>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let callback: SnapshotCallback = Box::new(move |documents| {
            received_clone
                .lock()
                .expect("Failed to lock received snapshots.")
                .push(documents);
        });
        (callback, received)
    }

    fn ids(documents: &[Document]) -> Vec<&str> {
        documents.iter().map(|document| document.id.as_str()).collect()
    }

    #[tokio::test]
    async fn subscribers_receive_initial_and_subsequent_snapshots() {
        let store = MemoryStore::new();
        store
            .upsert_document("presence", "a", fields(json!({ "name": "Ann" })))
            .await
            .expect("Error while upserting.");

        let (callback, received) = recording_callback();
        let _unsubscribe = store
            .subscribe_collection(CollectionQuery::new("presence"), callback)
            .await
            .expect("Error while subscribing.");

        store
            .upsert_document("presence", "b", fields(json!({ "name": "Bob" })))
            .await
            .expect("Error while upserting.");
        store
            .upsert_document("typing", "b", fields(json!({ "name": "Bob" })))
            .await
            .expect("Error while upserting.");

        let received = received.lock().expect("Failed to lock received snapshots.");
        assert_eq!(received.len(), 2);
        assert_eq!(ids(&received[0]), vec!["a"]);
        assert_eq!(ids(&received[1]), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn upsert_merges_and_resolves_server_timestamps() {
        let store = MemoryStore::new();
        store
            .upsert_document(
                "presence",
                "a",
                fields(json!({ "name": "Ann", "color": "#22c55e", "lastSeen": server_timestamp() })),
            )
            .await
            .expect("Error while upserting.");
        store
            .upsert_document("presence", "a", fields(json!({ "name": "Annie" })))
            .await
            .expect("Error while upserting.");

        let document = store
            .document("presence", "a")
            .await
            .expect("Document should exist.");
        assert_eq!(document.fields["name"], "Annie");
        assert_eq!(document.fields["color"], "#22c55e");
        assert!(document.fields["lastSeen"].is_string());
    }

    #[tokio::test]
    async fn update_requires_an_existing_document() {
        let store = MemoryStore::new();
        let result = store
            .update_document("presence", "ghost", fields(json!({ "name": "x" })))
            .await;

        assert!(matches!(result, Err(ChatError::DocumentNotFound { .. })));
        assert!(store.document("presence", "ghost").await.is_none());
    }

    #[tokio::test]
    async fn ordered_queries_sort_by_field_then_insertion() {
        let store = MemoryStore::new();
        let first = store
            .append_document("messages", fields(json!({ "timestamp": "2024-01-01T00:00:02Z" })))
            .await
            .expect("Error while appending.");
        let pending = store
            .append_document("messages", fields(json!({ "timestamp": null })))
            .await
            .expect("Error while appending.");
        let earliest = store
            .append_document("messages", fields(json!({ "timestamp": "2024-01-01T00:00:01Z" })))
            .await
            .expect("Error while appending.");
        let tied = store
            .append_document("messages", fields(json!({ "timestamp": "2024-01-01T00:00:02Z" })))
            .await
            .expect("Error while appending.");

        let (callback, received) = recording_callback();
        let _unsubscribe = store
            .subscribe_collection(
                CollectionQuery::new("messages").order_by("timestamp", Direction::Ascending),
                callback,
            )
            .await
            .expect("Error while subscribing.");

        let received = received.lock().expect("Failed to lock received snapshots.");
        assert_eq!(
            ids(&received[0]),
            vec![earliest.as_str(), first.as_str(), tied.as_str(), pending.as_str()]
        );
        assert_eq!(first.len(), GENERATED_ID_LENGTH);
    }

    #[tokio::test]
    async fn array_union_only_adds_missing_values() {
        let store = MemoryStore::new();
        let id = store
            .append_document("messages", fields(json!({ "readBy": ["a"] })))
            .await
            .expect("Error while appending.");

        let (callback, received) = recording_callback();
        let _unsubscribe = store
            .subscribe_collection(CollectionQuery::new("messages"), callback)
            .await
            .expect("Error while subscribing.");

        store
            .array_union("messages", &id, "readBy", vec![json!("a")])
            .await
            .expect("Error while adding to set.");
        store
            .array_union("messages", &id, "readBy", vec![json!("b"), json!("a")])
            .await
            .expect("Error while adding to set.");

        let document = store
            .document("messages", &id)
            .await
            .expect("Document should exist.");
        assert_eq!(document.fields["readBy"], json!(["a", "b"]));
        // initial snapshot plus the single effective union
        assert_eq!(received.lock().expect("Failed to lock.").len(), 2);
    }

    #[tokio::test]
    async fn unsubscribed_callbacks_stop_receiving() {
        let store = MemoryStore::new();
        let (callback, received) = recording_callback();
        let mut unsubscribe = store
            .subscribe_collection(CollectionQuery::new("typing"), callback)
            .await
            .expect("Error while subscribing.");
        assert_eq!(store.active_subscriptions().await, 1);

        unsubscribe.unsubscribe();
        unsubscribe.unsubscribe();
        assert_eq!(store.active_subscriptions().await, 0);

        store
            .upsert_document("typing", "a", fields(json!({ "name": "Ann" })))
            .await
            .expect("Error while upserting.");
        store
            .delete_document("typing", "a")
            .await
            .expect("Error while deleting.");

        assert_eq!(received.lock().expect("Failed to lock.").len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_missing_document_is_silent() {
        let store = MemoryStore::new();
        let (callback, received) = recording_callback();
        let _unsubscribe = store
            .subscribe_collection(CollectionQuery::new("typing"), callback)
            .await
            .expect("Error while subscribing.");

        store
            .delete_document("typing", "nobody")
            .await
            .expect("Deleting a missing document should succeed.");

        assert_eq!(received.lock().expect("Failed to lock.").len(), 1);
    }
}
