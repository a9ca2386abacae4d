//! mmcx Telegram Adapter
//!
//! Telegram Bot API long-polling with in-memory offset bootstrap, sliding
//! window update dedup, conversation routing for backend replies, and the
//! JSON-to-form send fallback for the "message text is empty" API quirk.

pub mod client;
pub mod dedup;
pub mod inbound;
pub mod outbound;
pub mod poll;
pub mod state;

use serde::{Deserialize, Serialize};

/// Typed mirror of the Bot API `Message` object, limited to the fields the
/// bridge reads. The poll loop itself stays on raw JSON so one malformed
/// update cannot poison a whole batch; these types are for the inbound
/// handler, after dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub voice: Option<TelegramVoice>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramVoice {
    pub file_id: String,
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}
