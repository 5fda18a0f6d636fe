use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    config::{ChatConfig, DecodeFallbacks},
    identity::{Identity, SharedIdentity},
    store::{
        CollectionQuery, Document, RealtimeStore, delete_best_effort, lenient_timestamp,
        server_timestamp, to_fields,
    },
    subscription::Subscription,
    types::{Result, SubscriptionState},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceRecord {
    pub identity_id: String,
    pub display_name: String,
    pub accent_color: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterEntry {
    pub display_name: String,
    pub accent_color: String,
}

#[derive(Default, Deserialize)]
struct PresenceFields {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(rename = "lastSeen", default, deserialize_with = "lenient_timestamp")]
    last_seen: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub(crate) fn from_document(document: &Document, fallbacks: &DecodeFallbacks) -> Self {
        let fields = document.decode::<PresenceFields>().unwrap_or_else(|error| {
            warn!("presence: malformed record {}: {error}", document.id);
            PresenceFields::default()
        });

        Self {
            identity_id: document.id.clone(),
            display_name: fields
                .name
                .unwrap_or_else(|| fallbacks.display_name.clone()),
            accent_color: fields
                .color
                .unwrap_or_else(|| fallbacks.accent_color.clone()),
            last_seen_at: fields.last_seen,
        }
    }
}

pub struct PresenceChannel {
    store: Arc<dyn RealtimeStore>,
    collection: String,
    fallbacks: DecodeFallbacks,
    identity: SharedIdentity,
    subscription: Subscription,
    users: Arc<watch::Sender<Vec<PresenceRecord>>>,
}

impl PresenceChannel {
    pub(crate) fn new(
        store: Arc<dyn RealtimeStore>,
        config: &ChatConfig,
        identity: SharedIdentity,
    ) -> Self {
        let collection = config.collections.presence.clone();
        let (users, _) = watch::channel(vec![]);

        Self {
            store,
            subscription: Subscription::new(CollectionQuery::new(&collection)),
            collection,
            fallbacks: config.fallbacks.clone(),
            identity,
            users: Arc::new(users),
        }
    }

    /// Registers this identity, then follows the roster. A failed registration
    /// is logged; the roster is still followed.
    pub async fn activate(&self) -> Result<()> {
        if let Err(error) = self.register().await {
            warn!("presence: failed to register: {error}");
        }

        let users = Arc::clone(&self.users);
        let fallbacks = self.fallbacks.clone();
        self.subscription
            .activate(self.store.as_ref(), move |documents| {
                let roster: Vec<PresenceRecord> = documents
                    .iter()
                    .map(|document| PresenceRecord::from_document(document, &fallbacks))
                    .collect();
                debug!("presence: {} participant(s) online.", roster.len());
                users.send_replace(roster);
                async {}
            })
            .await
    }

    pub async fn register(&self) -> Result<()> {
        let identity: Identity = self.identity.borrow().clone();
        let fields = to_fields(json!({
            "name": identity.display_name,
            "color": identity.accent_color,
            "lastSeen": server_timestamp(),
        }));

        self.store
            .upsert_document(&self.collection, &identity.id, fields)
            .await
    }

    /// Ignores names that are empty after trimming. The cached name changes
    /// before the write, so later messages carry it even if the write fails.
    pub async fn update_own_display_name(&self, new_name: &str) -> Result<()> {
        let trimmed = new_name.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        self.identity
            .send_modify(|identity| identity.display_name = String::from(trimmed));
        self.register().await
    }

    pub async fn remove_own_record(&self) {
        let id = self.identity.borrow().id.clone();
        delete_best_effort(self.store.as_ref(), &self.collection, &id).await;
    }

    pub async fn deactivate(&self) {
        self.subscription.teardown();
        self.remove_own_record().await;
    }

    pub(crate) fn teardown(&self) {
        self.subscription.teardown();
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn users(&self) -> Vec<PresenceRecord> {
        self.users.borrow().clone()
    }

    pub fn roster(&self) -> BTreeMap<String, RosterEntry> {
        self.users
            .borrow()
            .iter()
            .map(|record| {
                (
                    record.identity_id.clone(),
                    RosterEntry {
                        display_name: record.display_name.clone(),
                        accent_color: record.accent_color.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.users.subscribe()
    }
}
