use std::time::Duration;

use crate::{error::ChatError, store::Document};

// Constants
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(2500);
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";
pub const UNKNOWN_ACCENT_COLOR: &str = "#777777";

pub type Result<Type> = std::result::Result<Type, ChatError>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Active,
}

pub type SnapshotCallback = Box<dyn Fn(Vec<Document>) + Send + Sync>;
pub(crate) type DisposeCallback = Box<dyn FnOnce() + Send>;

/// Disposer returned by a store subscription. Invoking it more than once is a no-op.
pub struct Unsubscribe {
    dispose: Option<DisposeCallback>,
}

impl Unsubscribe {
    pub fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose.is_none()
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
