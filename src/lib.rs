pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod messages;
pub mod presence;
pub mod storage;
pub mod store;
pub mod subscription;
pub mod task;
pub mod types;
pub mod typing;

pub use chat::{ChatSession, ChatSnapshot};
pub use config::ChatConfig;
pub use error::ChatError;
pub use identity::{Identity, IdentityProvider};
pub use messages::ChatMessage;
pub use presence::{PresenceRecord, RosterEntry};
pub use store::{MemoryStore, RealtimeStore};
pub use typing::TypingMarker;
