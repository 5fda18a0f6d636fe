use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    config::ChatConfig,
    error::ChatError,
    identity::{IdentityProvider, SharedIdentity},
    messages::{ChatMessage, MessageChannel},
    presence::{PresenceChannel, PresenceRecord, RosterEntry},
    store::{RealtimeStore, delete_best_effort},
    typing::{TypingChannel, TypingMarker, typing_summary},
    types::{Result, SubscriptionState},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub current_user_id: String,
    pub username: String,
    pub color: String,
    pub users: Vec<PresenceRecord>,
    pub messages: Vec<ChatMessage>,
    pub typing_users: Vec<TypingMarker>,
}

pub struct ChatSession {
    store: Arc<dyn RealtimeStore>,
    config: ChatConfig,
    identity_provider: Arc<IdentityProvider>,
    identity: SharedIdentity,
    presence: PresenceChannel,
    messages: MessageChannel,
    typing: TypingChannel,
    closed: AtomicBool,
}

impl ChatSession {
    /// If any subscription fails, everything opened so far is torn down.
    pub async fn connect(
        store: Arc<dyn RealtimeStore>,
        identity_provider: Arc<IdentityProvider>,
        config: ChatConfig,
    ) -> Result<Self> {
        let (identity, _) = watch::channel(identity_provider.get_or_create_identity());
        let identity: SharedIdentity = Arc::new(identity);

        let session = Self {
            presence: PresenceChannel::new(Arc::clone(&store), &config, Arc::clone(&identity)),
            messages: MessageChannel::new(Arc::clone(&store), &config, Arc::clone(&identity)),
            typing: TypingChannel::new(Arc::clone(&store), &config, Arc::clone(&identity)),
            store,
            config,
            identity_provider,
            identity,
            closed: AtomicBool::new(false),
        };

        if let Err(error) = session.activate().await {
            session.shutdown().await;
            return Err(error);
        }

        info!(
            "chat: connected as {} ({}).",
            session.current_user_id(),
            session.username()
        );
        Ok(session)
    }

    async fn activate(&self) -> Result<()> {
        self.presence.activate().await?;
        self.messages.activate().await?;
        self.typing.activate().await?;
        Ok(())
    }

    pub fn current_user_id(&self) -> String {
        self.identity.borrow().id.clone()
    }

    pub fn username(&self) -> String {
        self.identity.borrow().display_name.clone()
    }

    pub fn color(&self) -> String {
        self.identity.borrow().accent_color.clone()
    }

    pub fn users(&self) -> Vec<PresenceRecord> {
        self.presence.users()
    }

    pub fn roster(&self) -> BTreeMap<String, RosterEntry> {
        self.presence.roster()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.messages()
    }

    pub fn typing_users(&self) -> Vec<TypingMarker> {
        self.typing.typing_users()
    }

    pub fn typing_summary(&self) -> String {
        typing_summary(&self.typing_users())
    }

    /// Messages from others that lack this identity's read receipt.
    pub fn unread_count(&self) -> usize {
        let own_id = self.current_user_id();
        self.messages()
            .iter()
            .filter(|message| message.is_unread_for(&own_id))
            .count()
    }

    /// Checked against the roster as currently observed.
    pub fn is_read_by_everyone(&self, message: &ChatMessage) -> bool {
        let users = self.users();
        message.is_read_by_all(users.iter().map(|user| user.identity_id.as_str()))
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let identity = self.identity.borrow().clone();
        ChatSnapshot {
            current_user_id: identity.id,
            username: identity.display_name,
            color: identity.accent_color,
            users: self.users(),
            messages: self.messages(),
            typing_users: self.typing_users(),
        }
    }

    pub fn watch_users(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.presence.watch()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.watch()
    }

    pub fn watch_typing_users(&self) -> watch::Receiver<Vec<TypingMarker>> {
        self.typing.watch()
    }

    /// `(presence, messages, typing)`
    pub fn subscription_states(&self) -> (SubscriptionState, SubscriptionState, SubscriptionState) {
        (
            self.presence.state(),
            self.messages.state(),
            self.typing.state(),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A failed presence write is returned; the new name is kept locally.
    pub async fn update_username(&self, new_name: &str) -> Result<()> {
        self.ensure_open()?;

        let trimmed = new_name.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        self.identity_provider.persist_display_name(trimmed);
        self.presence.update_own_display_name(trimmed).await
    }

    pub async fn send_message(&self, text: &str) -> Result<Option<String>> {
        self.ensure_open()?;

        let sent = self.messages.send_message(text).await?;
        if sent.is_some() {
            self.typing.set_typing(false);
        }
        Ok(sent)
    }

    pub fn set_typing(&self, is_typing: bool) {
        if self.is_closed() {
            debug!("chat: ignoring typing update on a closed session.");
            return;
        }
        self.typing.set_typing(is_typing);
    }

    /// Removes the own presence record and typing marker; subscriptions stay open.
    pub async fn handle_page_unload(&self) {
        debug!("chat: page unload, removing own records.");
        futures::join!(
            self.presence.remove_own_record(),
            self.typing.clear_own_marker()
        );
    }

    /// Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        futures::join!(self.presence.deactivate(), self.typing.deactivate());
        self.messages.teardown();
        info!("chat: session for {} shut down.", self.current_user_id());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ChatError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.presence.teardown();
        self.messages.teardown();
        self.typing.teardown();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("chat: dropped outside a runtime, own records are left to expire.");
            return;
        };

        let store = Arc::clone(&self.store);
        let id = self.current_user_id();
        let presence = self.config.collections.presence.clone();
        let typing = self.config.collections.typing.clone();
        runtime.spawn(async move {
            delete_best_effort(store.as_ref(), &presence, &id).await;
            delete_best_effort(store.as_ref(), &typing, &id).await;
        });
    }
}
