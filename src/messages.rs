use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    config::{ChatConfig, DecodeFallbacks},
    identity::{Identity, SharedIdentity},
    store::{
        CollectionQuery, Direction, Document, RealtimeStore, lenient_id_set, lenient_timestamp,
        server_timestamp, to_fields,
    },
    subscription::Subscription,
    types::{Result, SubscriptionState},
};

const TIMESTAMP_FIELD: &str = "timestamp";
const READ_BY_FIELD: &str = "readBy";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    /// Name and colour as they were when the message was sent.
    pub sender_display_name: String,
    pub sender_color: String,
    /// `None` until the store has committed the write.
    pub sent_at: Option<DateTime<Utc>>,
    pub read_by: BTreeSet<String>,
}

#[derive(Default, Deserialize)]
struct MessageFields {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "readBy", default, deserialize_with = "lenient_id_set")]
    read_by: BTreeSet<String>,
}

impl ChatMessage {
    pub(crate) fn from_document(document: &Document, fallbacks: &DecodeFallbacks) -> Self {
        let fields = document.decode::<MessageFields>().unwrap_or_else(|error| {
            warn!("messages: malformed message {}: {error}", document.id);
            MessageFields::default()
        });

        Self {
            id: document.id.clone(),
            text: fields.text.unwrap_or_default(),
            sender_id: fields.user_id.unwrap_or_default(),
            sender_display_name: fields
                .username
                .unwrap_or_else(|| fallbacks.display_name.clone()),
            sender_color: fields
                .color
                .unwrap_or_else(|| fallbacks.accent_color.clone()),
            sent_at: fields.timestamp,
            read_by: fields.read_by,
        }
    }

    pub fn is_read_by(&self, identity_id: &str) -> bool {
        self.read_by.contains(identity_id)
    }

    /// Someone else's message that `identity_id` has not acknowledged yet.
    pub fn is_unread_for(&self, identity_id: &str) -> bool {
        self.sender_id != identity_id && !self.is_read_by(identity_id)
    }

    /// `true` for an empty set of readers.
    pub fn is_read_by_all<'a, I>(&self, identity_ids: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identity_ids.into_iter().all(|id| self.is_read_by(id))
    }
}

pub struct MessageChannel {
    store: Arc<dyn RealtimeStore>,
    collection: String,
    fallbacks: DecodeFallbacks,
    identity: SharedIdentity,
    subscription: Subscription,
    messages: Arc<watch::Sender<Vec<ChatMessage>>>,
}

impl MessageChannel {
    pub(crate) fn new(
        store: Arc<dyn RealtimeStore>,
        config: &ChatConfig,
        identity: SharedIdentity,
    ) -> Self {
        let collection = config.collections.messages.clone();
        let (messages, _) = watch::channel(vec![]);

        Self {
            store,
            subscription: Subscription::new(
                CollectionQuery::new(&collection).order_by(TIMESTAMP_FIELD, Direction::Ascending),
            ),
            collection,
            fallbacks: config.fallbacks.clone(),
            identity,
            messages: Arc::new(messages),
        }
    }

    pub async fn activate(&self) -> Result<()> {
        let messages = Arc::clone(&self.messages);
        let fallbacks = self.fallbacks.clone();
        let store = Arc::clone(&self.store);
        let collection = self.collection.clone();
        let reader = self.identity.borrow().id.clone();

        self.subscription
            .activate(self.store.as_ref(), move |documents| {
                let feed: Vec<ChatMessage> = documents
                    .iter()
                    .map(|document| ChatMessage::from_document(document, &fallbacks))
                    .collect();
                messages.send_replace(feed.clone());

                let store = Arc::clone(&store);
                let collection = collection.clone();
                let reader = reader.clone();
                async move {
                    mark_read(store.as_ref(), &collection, &reader, &feed).await;
                }
            })
            .await
    }

    /// Blank text yields `Ok(None)` and writes nothing.
    pub async fn send_message(&self, raw_text: &str) -> Result<Option<String>> {
        let text = raw_text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let sender: Identity = self.identity.borrow().clone();
        let fields = to_fields(json!({
            "text": text,
            "username": sender.display_name,
            "userId": sender.id,
            "color": sender.accent_color,
            TIMESTAMP_FIELD: server_timestamp(),
            READ_BY_FIELD: [sender.id],
        }));

        let id = self.store.append_document(&self.collection, fields).await?;
        debug!("messages: sent {id}.");
        Ok(Some(id))
    }

    pub(crate) fn teardown(&self) {
        self.subscription.teardown();
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.subscribe()
    }
}

/// Adds `reader` to `readBy` of every message that lacks it. Failed writes
/// are left for the next snapshot, which re-evaluates the same condition.
async fn mark_read(
    store: &dyn RealtimeStore,
    collection: &str,
    reader: &str,
    feed: &[ChatMessage],
) {
    let receipts = feed
        .iter()
        .filter(|message| !message.is_read_by(reader))
        .map(|message| async move {
            let result = if store.supports_array_union() {
                store
                    .array_union(collection, &message.id, READ_BY_FIELD, vec![json!(reader)])
                    .await
            } else {
                // read-modify-write; a concurrent reader's receipt can be lost
                let mut read_by: Vec<Value> = message.read_by.iter().map(|id| json!(id)).collect();
                read_by.push(json!(reader));
                store
                    .update_document(collection, &message.id, to_fields(json!({ READ_BY_FIELD: read_by })))
                    .await
            };

            if let Err(error) = result {
                debug!("messages: read receipt for {} failed: {error}", message.id);
            }
        });

    join_all(receipts).await;
}
