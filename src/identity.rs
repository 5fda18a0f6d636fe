use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, seq::IndexedRandom};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::IdentityConfig, storage::KeyValueStorage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub accent_color: String,
}

/// Live identity shared by the channels of one session; only the display name changes.
pub(crate) type SharedIdentity = Arc<watch::Sender<Identity>>;

pub struct IdentityProvider {
    storage: Arc<dyn KeyValueStorage>,
    config: IdentityConfig,
    cached: Mutex<Option<Identity>>,
}

impl IdentityProvider {
    pub fn new(storage: Arc<dyn KeyValueStorage>, config: IdentityConfig) -> Self {
        Self {
            storage,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Never fails: values that cannot be read or written are generated for
    /// this session only.
    pub fn get_or_create_identity(&self) -> Identity {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(identity) = &*cached {
            return identity.clone();
        }

        let identity = Identity {
            id: self.load_or_generate(&self.config.user_id_key, || Uuid::new_v4().to_string()),
            display_name: self.load_or_generate(&self.config.username_key, || {
                self.generate_guest_name()
            }),
            accent_color: self.load_or_generate(&self.config.color_key, || {
                self.generate_accent_color()
            }),
        };

        debug!(
            "identity: using {} ({}, {}).",
            identity.id, identity.display_name, identity.accent_color
        );
        *cached = Some(identity.clone());
        identity
    }

    /// Records a new display name for later sessions. Storage failures are logged only.
    pub fn persist_display_name(&self, display_name: &str) {
        {
            let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(identity) = cached.as_mut() {
                identity.display_name = String::from(display_name);
            }
        }

        if let Err(error) = self.storage.set(&self.config.username_key, display_name) {
            warn!("identity: failed to persist display name: {error}");
        }
    }

    fn load_or_generate<F>(&self, key: &str, generate: F) -> String
    where
        F: FnOnce() -> String,
    {
        match self.storage.get(key) {
            Ok(Some(existing)) if !existing.is_empty() => return existing,
            Ok(_) => {}
            Err(error) => {
                warn!("identity: storage unavailable for '{key}', keeping value in memory: {error}");
                return generate();
            }
        }

        let value = generate();
        if let Err(error) = self.storage.set(key, &value) {
            warn!("identity: failed to persist '{key}', keeping value in memory: {error}");
        }
        value
    }

    fn generate_guest_name(&self) -> String {
        let number: u16 = rand::rng().random_range(1000..10000);
        format!("{}{number}", self.config.guest_prefix)
    }

    fn generate_accent_color(&self) -> String {
        self.config
            .palette
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| self.config.default_color.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DEFAULT_PALETTE,
        error::ChatError,
        storage::MemoryStorage,
        types::Result,
    };

    struct BrokenStorage;

    impl KeyValueStorage for BrokenStorage {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(ChatError::StorageUnavailable {
                reason: String::from("disabled"),
            })
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(ChatError::StorageUnavailable {
                reason: String::from("disabled"),
            })
        }
    }

    fn provider(storage: Arc<dyn KeyValueStorage>) -> IdentityProvider {
        IdentityProvider::new(storage, IdentityConfig::default())
    }

    #[test]
    fn generated_identity_has_expected_shape() {
        let identity = provider(Arc::new(MemoryStorage::new())).get_or_create_identity();

        assert!(Uuid::parse_str(&identity.id).is_ok());

        let digits = identity
            .display_name
            .strip_prefix("Guest-")
            .expect("Guest names start with the prefix.");
        let number: u32 = digits.parse().expect("Guest suffix is numeric.");
        assert_eq!(digits.len(), 4);
        assert!((1000..=9999).contains(&number));

        assert!(DEFAULT_PALETTE.contains(&identity.accent_color.as_str()));
    }

    #[test]
    fn identity_is_stable_within_a_persisted_profile() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());

        let first = provider(Arc::clone(&storage)).get_or_create_identity();
        let second = provider(Arc::clone(&storage)).get_or_create_identity();

        assert_eq!(first, second);
        assert_eq!(
            storage.get("chat_user_id").expect("get failed"),
            Some(first.id.clone())
        );
        assert_eq!(
            storage.get("chat_username").expect("get failed"),
            Some(first.display_name.clone())
        );
        assert_eq!(
            storage.get("chat_user_color").expect("get failed"),
            Some(first.accent_color.clone())
        );
    }

    #[test]
    fn keys_are_bootstrapped_independently() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        storage.set("chat_username", "Alice").expect("set failed");

        let identity = provider(Arc::clone(&storage)).get_or_create_identity();

        assert_eq!(identity.display_name, "Alice");
        assert!(!identity.id.is_empty());
        assert!(storage.get("chat_user_id").expect("get failed").is_some());
    }

    #[test]
    fn unavailable_storage_falls_back_to_session_identity() {
        let provider = provider(Arc::new(BrokenStorage));

        let first = provider.get_or_create_identity();
        let second = provider.get_or_create_identity();

        assert!(!first.id.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn persisted_display_name_survives_a_new_provider() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let original = provider(Arc::clone(&storage));
        let identity = original.get_or_create_identity();

        original.persist_display_name("Alice");
        assert_eq!(original.get_or_create_identity().display_name, "Alice");

        let reloaded = provider(storage).get_or_create_identity();
        assert_eq!(reloaded.display_name, "Alice");
        assert_eq!(reloaded.id, identity.id);
        assert_eq!(reloaded.accent_color, identity.accent_color);
    }

    #[test]
    fn empty_palette_uses_the_default_color() {
        let config = IdentityConfig {
            palette: vec![],
            default_color: String::from("#123456"),
            ..IdentityConfig::default()
        };
        let identity =
            IdentityProvider::new(Arc::new(MemoryStorage::new()), config).get_or_create_identity();

        assert_eq!(identity.accent_color, "#123456");
    }
}
