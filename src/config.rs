use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DEFAULT_TYPING_TIMEOUT, Result, UNKNOWN_ACCENT_COLOR, UNKNOWN_DISPLAY_NAME};

pub const DEFAULT_PALETTE: [&str; 7] = [
    "#22c55e", "#3b82f6", "#eab308", "#ec4899", "#8b5cf6", "#f97316", "#ef4444",
];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub collections: CollectionNames,
    pub typing: TypingConfig,
    pub identity: IdentityConfig,
    pub fallbacks: DecodeFallbacks,
}

impl ChatConfig {
    /// Parses a partial JSON config; omitted sections keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionNames {
    pub presence: String,
    pub messages: String,
    pub typing: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            presence: String::from("presence"),
            messages: String::from("messages"),
            typing: String::from("typing"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    pub timeout_ms: u64,
}

impl TypingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TYPING_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_id_key: String,
    pub username_key: String,
    pub color_key: String,
    pub guest_prefix: String,
    pub palette: Vec<String>,
    /// Used when the palette is empty.
    pub default_color: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id_key: String::from("chat_user_id"),
            username_key: String::from("chat_username"),
            color_key: String::from("chat_user_color"),
            guest_prefix: String::from("Guest-"),
            palette: DEFAULT_PALETTE.iter().map(|c| String::from(*c)).collect(),
            default_color: String::from(DEFAULT_PALETTE[0]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeFallbacks {
    pub display_name: String,
    pub accent_color: String,
}

impl Default for DecodeFallbacks {
    fn default() -> Self {
        Self {
            display_name: String::from(UNKNOWN_DISPLAY_NAME),
            accent_color: String::from(UNKNOWN_ACCENT_COLOR),
        }
    }
}
