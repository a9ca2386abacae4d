//! Inbound side of the bridge: raw updates become MMC envelopes.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use mmcx_ipc::{Envelope, EventBus, MessageKind};

use crate::client::TelegramClient;
use crate::poll::UpdateHandler;
use crate::state::RuntimeState;
use crate::{TelegramMessage, TelegramUser};

/// Display name for the sender: username when set, otherwise the real-name
/// parts, otherwise a placeholder.
pub fn pick_username(user: Option<&TelegramUser>) -> String {
    let Some(user) = user else {
        return "unknown".to_string();
    };
    if let Some(username) = user.username.as_deref().filter(|u| !u.is_empty()) {
        return username.to_string();
    }
    let mut name = user.first_name.clone().unwrap_or_default();
    if let Some(last) = user.last_name.as_deref() {
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(last);
    }
    let name = name.trim().to_string();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

/// Converts deduplicated updates into [`Envelope`]s on the event bus, keeping
/// the runtime conversation state current along the way.
pub struct BridgeHandler {
    client: Arc<TelegramClient>,
    state: Arc<Mutex<RuntimeState>>,
    bus: EventBus,
}

impl BridgeHandler {
    pub fn new(
        client: Arc<TelegramClient>,
        state: Arc<Mutex<RuntimeState>>,
        bus: EventBus,
    ) -> Self {
        Self { client, state, bus }
    }

    /// Fetch + base64-encode the payload of an inbound media attachment.
    /// Best-effort: on failure the message is still forwarded, just without
    /// the bytes.
    async fn fetch_media(&self, kind: &str, file_id: &str) -> Option<Value> {
        let file_path = match self.client.get_file_path(file_id).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                warn!(kind, file_id, "getFile returned no file_path");
                return None;
            }
            Err(e) => {
                warn!(kind, file_id, "getFile failed: {e:#}");
                return None;
            }
        };
        match self.client.download_file(&file_path).await {
            Ok(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                Some(json!({ "kind": kind, "base64": encoded }))
            }
            Err(e) => {
                warn!(kind, file_id, "media download failed: {e:#}");
                None
            }
        }
    }

    async fn media_payload(&self, message: &TelegramMessage) -> Option<Value> {
        if let Some(sizes) = &message.photo {
            // Telegram lists several resolutions of the same photo; take the
            // largest.
            if let Some(best) = sizes.iter().max_by_key(|s| s.width.saturating_mul(s.height)) {
                return self.fetch_media("photo", &best.file_id).await;
            }
        }
        if let Some(voice) = &message.voice {
            return self.fetch_media("voice", &voice.file_id).await;
        }
        None
    }
}

#[async_trait]
impl UpdateHandler for BridgeHandler {
    async fn handle_update(&self, update: &Value) -> Result<()> {
        let Some(raw_message) = update.get("message") else {
            debug!("ignoring update without message payload");
            return Ok(());
        };
        let message: TelegramMessage =
            serde_json::from_value(raw_message.clone()).context("malformed message payload")?;

        let bot_id = {
            let mut state = self.state.lock().await;
            state.note_chat(message.chat.id, &message.chat.chat_type);
            state.bot_id()
        };

        // Our own sends come back through getUpdates in group chats; looping
        // them into the backend would make the bot talk to itself.
        if let (Some(bot_id), Some(from)) = (bot_id, &message.from) {
            if from.id == bot_id {
                debug!(chat_id = message.chat.id, "ignoring own message echo");
                return Ok(());
            }
        }

        let media = self.media_payload(&message).await;
        let text = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .or_else(|| media.as_ref().map(|_| String::new()));
        let Some(text) = text else {
            debug!(
                chat_id = message.chat.id,
                "ignoring message without text or supported media"
            );
            return Ok(());
        };

        let from_id = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();
        let username = pick_username(message.from.as_ref());

        info!(
            chat_id = message.chat.id,
            from = %username,
            "forwarding inbound message"
        );

        let mut payload = json!({
            "chat_type": message.chat.chat_type,
            "username": username,
        });
        if let Some(media) = media {
            payload["media"] = media;
        }

        let envelope = Envelope::new("telegram", MessageKind::Message { from: from_id, text })
            .with_chat_id(message.chat.id)
            .with_message_id(message.message_id)
            .with_payload(payload);

        if let Err(e) = self.bus.publish(envelope) {
            warn!("failed to publish inbound message to event bus: {e:#}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(username: Option<&str>, first: Option<&str>, last: Option<&str>) -> TelegramUser {
        TelegramUser {
            id: 1,
            is_bot: None,
            username: username.map(str::to_string),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
        }
    }

    #[test]
    fn username_wins_over_real_name() {
        let u = user(Some("alice_bot"), Some("Alice"), Some("Doe"));
        assert_eq!(pick_username(Some(&u)), "alice_bot");
    }

    #[test]
    fn real_name_parts_are_joined() {
        let u = user(None, Some("Alice"), Some("Doe"));
        assert_eq!(pick_username(Some(&u)), "Alice Doe");
        let u = user(None, Some("Alice"), None);
        assert_eq!(pick_username(Some(&u)), "Alice");
        let u = user(None, None, Some("Doe"));
        assert_eq!(pick_username(Some(&u)), "Doe");
    }

    #[test]
    fn missing_names_fall_back_to_placeholder() {
        assert_eq!(pick_username(None), "unknown");
        let u = user(None, None, None);
        assert_eq!(pick_username(Some(&u)), "unknown");
    }
}
