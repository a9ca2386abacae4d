//! Outbound side of the bridge: backend messages become Telegram sends.
//!
//! Resolution precedence for the destination chat:
//! 1. explicit group identity
//! 2. per-message chat hint from the backend
//! 3. the backend echoing our own bot as the "user": resolve the referenced
//!    reply message through the conversation index, else the last private chat
//! 4. the user identity itself
//! Nothing resolvable is a routing error and drops the message.

use std::sync::Arc;

use anyhow::{bail, Result};
use base64::Engine as _;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use mmcx_ipc::{OutboundMessage, Segment};

use crate::client::{ApiReply, ChatTarget, TelegramClient};
use crate::state::RuntimeState;

/// Parse a backend chat identity. Identities may arrive as
/// `"platform:12345"`; only the part after the last colon is the id. Anything
/// non-numeric is passed through as a named target (`@channel` style).
pub fn normalize_chat_id(raw: &str) -> ChatTarget {
    let text = raw.trim();
    let tail = text.rsplit(':').next().unwrap_or(text).trim();
    match tail.parse::<i64>() {
        Ok(id) => ChatTarget::Id(id),
        Err(_) => ChatTarget::Name(text.to_string()),
    }
}

/// The message id a reply should attach to: the explicit field when the
/// backend set it, otherwise the first `reply` marker segment.
pub fn extract_reply(msg: &OutboundMessage) -> Option<i64> {
    if let Some(id) = msg.reply_to {
        return Some(id);
    }
    let mut stack = vec![&msg.segment];
    while let Some(segment) = stack.pop() {
        match segment {
            Segment::List(items) => {
                for item in items.iter().rev() {
                    stack.push(item);
                }
            }
            Segment::Reply(data) => {
                if let Ok(id) = data.trim().parse::<i64>() {
                    return Some(id);
                }
            }
            _ => {}
        }
    }
    None
}

fn non_empty(field: Option<&str>) -> Option<&str> {
    field.map(str::trim).filter(|s| !s.is_empty())
}

/// Pick the destination chat. Returns the target plus the name of the rule
/// that fired, for the routing log.
pub fn resolve_target(
    msg: &OutboundMessage,
    state: &RuntimeState,
) -> Result<(ChatTarget, &'static str)> {
    if let Some(group) = non_empty(msg.group_id.as_deref()) {
        return Ok((normalize_chat_id(group), "group"));
    }
    if let Some(hint) = msg.chat_hint {
        return Ok((ChatTarget::Id(hint), "chat-hint"));
    }
    if let Some(user) = non_empty(msg.user_id.as_deref()) {
        let target = normalize_chat_id(user);
        let is_self_echo = matches!(
            (&target, state.bot_id()),
            (ChatTarget::Id(user_id), Some(bot_id)) if *user_id == bot_id
        );
        if is_self_echo {
            // The backend cannot say "reply in the same chat", so it names us
            // as the sender and references one of our own message ids.
            if let Some(chat) = extract_reply(msg).and_then(|mid| state.chat_for_message(mid)) {
                return Ok((ChatTarget::Id(chat), "reply-index"));
            }
            if let Some(chat) = state.last_private_chat() {
                return Ok((ChatTarget::Id(chat), "last-private"));
            }
            warn!("backend echoed our own identity but no reply chat is known");
        }
        return Ok((target, "user"));
    }
    bail!("no destination chat for outbound message (no group, user, or chat hint)");
}

/// One concrete Telegram API call derived from a segment.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOp {
    Text { text: String, reply_to: Option<i64> },
    PhotoBytes(String),
    PhotoUrl(String),
    VoiceBytes(String),
    VideoUrl(String),
    DocumentUrl(String),
    AnimationBytes(String),
}

impl SendOp {
    fn kind(&self) -> &'static str {
        match self {
            SendOp::Text { .. } => "text",
            SendOp::PhotoBytes(_) => "image",
            SendOp::PhotoUrl(_) => "imageurl",
            SendOp::VoiceBytes(_) => "voice",
            SendOp::VideoUrl(_) => "videourl",
            SendOp::DocumentUrl(_) => "file",
            SendOp::AnimationBytes(_) => "emoji",
        }
    }
}

/// Turn flattened segments into ordered send operations. Only the first
/// text-bearing segment carries the reply association; reply markers and
/// unknown segment types are dropped here.
pub fn plan_sends(segments: Vec<Segment>, mut reply_to: Option<i64>) -> Vec<SendOp> {
    let mut ops = Vec::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => ops.push(SendOp::Text {
                text,
                reply_to: reply_to.take(),
            }),
            Segment::Image(data) => ops.push(SendOp::PhotoBytes(data)),
            Segment::ImageUrl(url) => ops.push(SendOp::PhotoUrl(url)),
            Segment::Voice(data) => ops.push(SendOp::VoiceBytes(data)),
            Segment::VideoUrl(url) => ops.push(SendOp::VideoUrl(url)),
            Segment::FileUrl(url) => ops.push(SendOp::DocumentUrl(url)),
            Segment::Emoji(data) => ops.push(SendOp::AnimationBytes(data)),
            Segment::Reply(_) | Segment::List(_) => {}
            Segment::Unknown { kind } => {
                debug!(kind = %kind, "skipping unsupported segment type");
            }
        }
    }
    ops
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data.trim())?)
}

/// Consumes backend messages from the event bus and drives the Telegram send
/// protocol for each.
pub struct OutboundSender {
    client: Arc<TelegramClient>,
    state: Arc<Mutex<RuntimeState>>,
}

impl OutboundSender {
    pub fn new(client: Arc<TelegramClient>, state: Arc<Mutex<RuntimeState>>) -> Self {
        Self { client, state }
    }

    async fn execute(&self, target: &ChatTarget, op: SendOp) -> Result<ApiReply> {
        match op {
            SendOp::Text { text, reply_to } => {
                self.client.send_text(target, &text, reply_to).await
            }
            SendOp::PhotoBytes(data) => {
                self.client
                    .send_photo_bytes(target, decode_base64(&data)?, None)
                    .await
            }
            SendOp::PhotoUrl(url) => self.client.send_photo_url(target, &url, None).await,
            SendOp::VoiceBytes(data) => {
                self.client
                    .send_voice_bytes(target, decode_base64(&data)?, None)
                    .await
            }
            SendOp::VideoUrl(url) => self.client.send_video_url(target, &url, None).await,
            SendOp::DocumentUrl(url) => self.client.send_document_url(target, &url, None).await,
            SendOp::AnimationBytes(data) => {
                self.client
                    .send_animation_bytes(target, decode_base64(&data)?, None)
                    .await
            }
        }
    }

    /// Route and dispatch one backend message. Segments go out strictly in
    /// order; individual failures are logged and skipped, and only a
    /// zero-success outcome is escalated.
    pub async fn handle_message(&self, msg: OutboundMessage) -> Result<()> {
        let (target, rule) = {
            let state = self.state.lock().await;
            resolve_target(&msg, &state)?
        };
        let reply_to = extract_reply(&msg);

        info!(target = %target, rule, "routing outbound message");

        let ops = plan_sends(msg.segment.flatten(), reply_to);
        if ops.is_empty() {
            warn!(target = %target, "outbound message carries no sendable segments");
            return Ok(());
        }

        let mut sent = 0usize;
        for op in ops {
            let kind = op.kind();
            match self.execute(&target, op).await {
                Ok(reply) if reply.is_ok() => {
                    sent += 1;
                    if let (Some(message_id), Some(chat_id)) = (reply.message_id(), target.id()) {
                        self.state.lock().await.record_message(chat_id, message_id);
                    }
                    debug!(target = %target, kind, "segment delivered");
                }
                Ok(reply) => {
                    error!(
                        target = %target,
                        kind,
                        "telegram rejected segment: {:?}",
                        reply.description()
                    );
                }
                Err(e) => {
                    error!(target = %target, kind, "failed to send segment: {e:#}");
                }
            }
        }

        if sent == 0 {
            warn!(target = %target, "no segment of the outbound message was delivered");
        }
        Ok(())
    }

    /// Consume the outbound side of the event bus until cancellation.
    pub async fn run(
        &self,
        mut rx: broadcast::Receiver<OutboundMessage>,
        mut cancel: watch::Receiver<bool>,
    ) {
        info!("telegram outbound sender started");
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    info!("telegram outbound sender shutting down");
                    return;
                }
                received = rx.recv() => match received {
                    Ok(msg) => {
                        if msg.channel != "telegram" {
                            continue;
                        }
                        if let Err(e) = self.handle_message(msg).await {
                            error!("dropping unroutable outbound message: {e:#}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("outbound channel closed, stopping sender");
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outbound consumer lagged, messages were dropped");
                    }
                }
            }
        }
    }
}
