use std::{
    fmt::Display,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot, watch,
};
use tracing::{debug, warn};

use crate::{
    config::{ChatConfig, DecodeFallbacks},
    identity::SharedIdentity,
    store::{
        CollectionQuery, Document, RealtimeStore, delete_best_effort, lenient_timestamp,
        server_timestamp, to_fields,
    },
    subscription::Subscription,
    task::Task,
    types::{Result, SubscriptionState},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypingMarker {
    pub identity_id: String,
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Default, Deserialize)]
struct TypingFields {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

impl TypingMarker {
    pub(crate) fn from_document(document: &Document, fallbacks: &DecodeFallbacks) -> Self {
        let fields = document.decode::<TypingFields>().unwrap_or_else(|error| {
            warn!("typing: malformed marker {}: {error}", document.id);
            TypingFields::default()
        });

        Self {
            identity_id: document.id.clone(),
            display_name: fields
                .name
                .unwrap_or_else(|| fallbacks.display_name.clone()),
            started_at: fields.timestamp,
        }
    }
}

const SUMMARY_NAME_LIMIT: usize = 3;

/// Human-readable line such as `"Ann and Bob are typing…"`. Empty when nobody
/// is typing; beyond three names the list is cut and ends in an ellipsis.
pub fn typing_summary(markers: &[TypingMarker]) -> String {
    let names: Vec<&str> = markers
        .iter()
        .map(|marker| marker.display_name.as_str())
        .collect();

    match names.as_slice() {
        [] => String::new(),
        [only] => format!("{only} is typing…"),
        [first, second] => format!("{first} and {second} are typing…"),
        _ => {
            let shown = names[..SUMMARY_NAME_LIMIT].join(", ");
            let cut = if names.len() > SUMMARY_NAME_LIMIT { "…" } else { "" };
            format!("{shown}{cut} are typing…")
        }
    }
}

#[derive(Debug)]
enum TypingWrite {
    Start { display_name: String },
    Stop,
    /// Answered once every write queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

impl Display for TypingWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypingWrite::Start { .. } => write!(f, "start"),
            TypingWrite::Stop => write!(f, "stop"),
            TypingWrite::Flush(_) => write!(f, "flush"),
        }
    }
}

/// Publishes the own typing marker and follows everybody else's.
///
/// Marker writes go through one ordered queue drained by a writer task, so a
/// `Stop` can never overtake the `Start` issued before it. The expiry timer
/// is a single slot: arming it cancels the previous timer.
pub struct TypingChannel {
    store: Arc<dyn RealtimeStore>,
    collection: String,
    fallbacks: DecodeFallbacks,
    identity: SharedIdentity,
    timeout: Duration,
    subscription: Subscription,
    typing_users: Arc<watch::Sender<Vec<TypingMarker>>>,
    writes: UnboundedSender<TypingWrite>,
    mutable_state: Mutex<TypingChannelMutableState>,
    closed: AtomicBool,
}

struct TypingChannelMutableState {
    pending_writes: Option<UnboundedReceiver<TypingWrite>>,
    writer: Option<Task<()>>,
    expiry: Option<Task<()>>,
}

impl TypingChannel {
    pub(crate) fn new(
        store: Arc<dyn RealtimeStore>,
        config: &ChatConfig,
        identity: SharedIdentity,
    ) -> Self {
        let collection = config.collections.typing.clone();
        let (typing_users, _) = watch::channel(vec![]);
        let (writes, pending_writes) = unbounded_channel();

        Self {
            store,
            subscription: Subscription::new(CollectionQuery::new(&collection)),
            collection,
            fallbacks: config.fallbacks.clone(),
            identity,
            timeout: config.typing.timeout(),
            typing_users: Arc::new(typing_users),
            writes,
            mutable_state: Mutex::new(TypingChannelMutableState {
                pending_writes: Some(pending_writes),
                writer: None,
                expiry: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn activate(&self) -> Result<()> {
        let own_id = self.identity.borrow().id.clone();

        let pending_writes = self.lock().pending_writes.take();
        if let Some(pending_writes) = pending_writes {
            let writer = Task::spawn(apply_writes(
                Arc::clone(&self.store),
                self.collection.clone(),
                own_id.clone(),
                pending_writes,
            ));
            self.lock().writer = Some(writer);
        }

        let typing_users = Arc::clone(&self.typing_users);
        let fallbacks = self.fallbacks.clone();
        self.subscription
            .activate(self.store.as_ref(), move |documents| {
                let others: Vec<TypingMarker> = documents
                    .iter()
                    .filter(|document| document.id != own_id)
                    .map(|document| TypingMarker::from_document(document, &fallbacks))
                    .collect();
                typing_users.send_replace(others);
                async {}
            })
            .await
    }

    /// Must be called within a tokio runtime.
    pub fn set_typing(&self, is_typing: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if is_typing {
            let display_name = self.identity.borrow().display_name.clone();
            self.enqueue(TypingWrite::Start { display_name });
            self.arm_expiry();
        } else {
            self.disarm_expiry();
            self.enqueue(TypingWrite::Stop);
        }
    }

    /// Stops the writer and the timer, drops queued writes, then deletes the
    /// own marker directly. Failures are swallowed.
    pub async fn deactivate(&self) {
        self.teardown();
        self.remove_own_marker().await;
    }

    /// Disarms the timer and deletes the marker behind any queued writes, so a
    /// pending `Start` cannot bring it back. Resolves once the delete ran.
    pub async fn clear_own_marker(&self) {
        self.disarm_expiry();

        let writer_running = self.lock().writer.is_some();
        if writer_running {
            let (applied, done) = oneshot::channel();
            self.enqueue(TypingWrite::Stop);
            if self.writes.send(TypingWrite::Flush(applied)).is_ok() && done.await.is_ok() {
                return;
            }
        }

        // writer never started or already gone
        self.remove_own_marker().await;
    }

    pub async fn remove_own_marker(&self) {
        let id = self.identity.borrow().id.clone();
        delete_best_effort(self.store.as_ref(), &self.collection, &id).await;
    }

    pub(crate) fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscription.teardown();

        let mut mutable_state = self.lock();
        if let Some(expiry) = mutable_state.expiry.take() {
            expiry.cancel();
        }
        if let Some(writer) = mutable_state.writer.take() {
            writer.cancel();
        }
        mutable_state.pending_writes = None;
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn typing_users(&self) -> Vec<TypingMarker> {
        self.typing_users.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<TypingMarker>> {
        self.typing_users.subscribe()
    }

    pub fn has_pending_expiry(&self) -> bool {
        self.lock()
            .expiry
            .as_ref()
            .is_some_and(|expiry| !expiry.is_finished())
    }

    fn enqueue(&self, write: TypingWrite) {
        if let Err(error) = self.writes.send(write) {
            debug!("typing: dropped {} write, channel is closed.", error.0);
        }
    }

    fn arm_expiry(&self) {
        let writes = self.writes.clone();
        let timeout = self.timeout;

        let mut mutable_state = self.lock();
        if let Some(previous) = mutable_state.expiry.take() {
            previous.cancel();
        }
        mutable_state.expiry = Some(Task::spawn(async move {
            tokio::time::sleep(timeout).await;
            if writes.send(TypingWrite::Stop).is_err() {
                debug!("typing: expiry fired after the channel closed.");
            }
        }));
    }

    fn disarm_expiry(&self) {
        if let Some(expiry) = self.lock().expiry.take() {
            expiry.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TypingChannelMutableState> {
        self.mutable_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn apply_writes(
    store: Arc<dyn RealtimeStore>,
    collection: String,
    own_id: String,
    mut pending_writes: UnboundedReceiver<TypingWrite>,
) {
    while let Some(write) = pending_writes.recv().await {
        let write = match write {
            TypingWrite::Flush(applied) => {
                if applied.send(()).is_err() {
                    debug!("typing: flush requester went away.");
                }
                continue;
            }
            other => other,
        };

        let result = match &write {
            TypingWrite::Start { display_name } => {
                let fields = to_fields(json!({
                    "name": display_name,
                    "timestamp": server_timestamp(),
                }));
                store.upsert_document(&collection, &own_id, fields).await
            }
            TypingWrite::Stop => store.delete_document(&collection, &own_id).await,
            TypingWrite::Flush(_) => Ok(()),
        };

        if let Err(error) = result {
            debug!("typing: {write} write failed: {error}");
        }
    }
}
