//! mmcx IPC - the MMC router boundary
//!
//! Envelope and outbound-message shapes exchanged with the MMC chat backend,
//! plus the in-process event bus the adapter and the router task share.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

/// One inbound unit published to the MMC router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub id: String,
    pub channel: String,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message { from: String, text: String },

    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            id: generate_trace_id(),
            channel: channel.to_string(),
            kind,
            payload: serde_json::json!({}),
            chat_id: None,
            message_id: None,
        }
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One unit of outbound content, wire shape `{"type": ..., "data": ...}`.
///
/// The MMC router nests lists arbitrarily; [`Segment::flatten`] turns any
/// tree into the flat, ordered sequence the adapter actually dispatches.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    /// Base64-encoded image bytes.
    Image(String),
    ImageUrl(String),
    /// Base64-encoded voice bytes.
    Voice(String),
    VideoUrl(String),
    FileUrl(String),
    /// Base64-encoded animation bytes.
    Emoji(String),
    /// Marker naming the message id a reply should attach to.
    Reply(String),
    List(Vec<Segment>),
    /// A segment type this bridge does not understand. Kept so one exotic
    /// segment cannot fail the whole message.
    Unknown { kind: String },
}

impl Segment {
    pub fn kind(&self) -> &str {
        match self {
            Segment::Text(_) => "text",
            Segment::Image(_) => "image",
            Segment::ImageUrl(_) => "imageurl",
            Segment::Voice(_) => "voice",
            Segment::VideoUrl(_) => "videourl",
            Segment::FileUrl(_) => "file",
            Segment::Emoji(_) => "emoji",
            Segment::Reply(_) => "reply",
            Segment::List(_) => "seglist",
            Segment::Unknown { kind } => kind,
        }
    }

    /// Depth-first, order-preserving flattening of nested lists.
    ///
    /// Iterative on purpose: nesting depth is router-controlled input.
    pub fn flatten(self) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(segment) = stack.pop() {
            match segment {
                Segment::List(items) => {
                    for item in items.into_iter().rev() {
                        stack.push(item);
                    }
                }
                other => out.push(other),
            }
        }
        out
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = serializer.serialize_struct("Segment", 2)?;
        st.serialize_field("type", self.kind())?;
        match self {
            Segment::List(items) => st.serialize_field("data", items)?,
            Segment::Unknown { .. } => st.serialize_field("data", &serde_json::Value::Null)?,
            Segment::Text(data)
            | Segment::Image(data)
            | Segment::ImageUrl(data)
            | Segment::Voice(data)
            | Segment::VideoUrl(data)
            | Segment::FileUrl(data)
            | Segment::Emoji(data)
            | Segment::Reply(data) => st.serialize_field("data", data)?,
        }
        st.end()
    }
}

#[derive(Deserialize)]
struct RawSegment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn string_data<E: serde::de::Error>(kind: &str, data: serde_json::Value) -> Result<String, E> {
    match data {
        serde_json::Value::String(s) => Ok(s),
        // Reply targets in particular arrive as bare numbers from some routers.
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(E::custom(format!(
            "segment '{}' carries non-string data: {}",
            kind, other
        ))),
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let RawSegment { kind, data } = RawSegment::deserialize(deserializer)?;
        let known = match kind.as_str() {
            "text" => Some(Segment::Text(string_data(&kind, data)?)),
            "image" => Some(Segment::Image(string_data(&kind, data)?)),
            "imageurl" => Some(Segment::ImageUrl(string_data(&kind, data)?)),
            "voice" => Some(Segment::Voice(string_data(&kind, data)?)),
            "videourl" => Some(Segment::VideoUrl(string_data(&kind, data)?)),
            "file" => Some(Segment::FileUrl(string_data(&kind, data)?)),
            "emoji" => Some(Segment::Emoji(string_data(&kind, data)?)),
            "reply" => Some(Segment::Reply(string_data(&kind, data)?)),
            "seglist" => {
                let items: Vec<Segment> =
                    serde_json::from_value(data).map_err(D::Error::custom)?;
                Some(Segment::List(items))
            }
            _ => None,
        };
        Ok(known.unwrap_or(Segment::Unknown { kind }))
    }
}

/// A message the MMC backend pushes through the bridge toward Telegram.
///
/// `group_id` / `user_id` are the backend's logical identities and may carry
/// a `platform:` prefix; `chat_hint` is a per-message chat override the
/// backend threads through when it already knows the concrete chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub chat_hint: Option<i64>,
    #[serde(default)]
    pub reply_to: Option<i64>,
    pub segment: Segment,
}

impl OutboundMessage {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message() -> MessageKind {
        MessageKind::Message {
            from: "user".to_string(),
            text: "hello".to_string(),
        }
    }

    #[test]
    fn envelope_has_schema_version_and_trace_id() {
        let env = Envelope::new("telegram", text_message());
        assert_eq!(env.schema_version, 1);
        assert!(env.trace_id.starts_with("trace-"));
    }

    #[test]
    fn trace_id_different_for_each_envelope() {
        let env1 = Envelope::new("telegram", text_message());
        let env2 = Envelope::new("telegram", text_message());
        assert_ne!(env1.trace_id, env2.trace_id);
    }

    #[test]
    fn legacy_envelope_without_new_fields_gets_defaults() {
        let old_json = r#"{
            "id": "test-id",
            "channel": "telegram",
            "kind": {"type": "message", "from": "user", "text": "hello"},
            "payload": {},
            "chat_id": 123,
            "message_id": 456
        }"#;
        let env = Envelope::from_json(old_json).expect("deserialize");
        assert_eq!(env.schema_version, 1);
        assert!(env.trace_id.starts_with("trace-"));
        assert_eq!(env.chat_id, Some(123));
    }

    #[test]
    fn envelope_roundtrip_preserves_fields() {
        let env = Envelope::new("telegram", text_message())
            .with_chat_id(123)
            .with_message_id(456);
        let json = env.to_json().expect("serialize");
        let parsed = Envelope::from_json(&json).expect("deserialize");
        assert_eq!(parsed.trace_id, env.trace_id);
        assert_eq!(parsed.chat_id, Some(123));
        assert_eq!(parsed.message_id, Some(456));
    }

    #[test]
    fn error_frames_deserialize() {
        let json = r#"{
            "id": "e-1",
            "channel": "telegram",
            "kind": {"type": "error", "code": 429, "message": "slow down"},
            "payload": {},
            "chat_id": null,
            "message_id": null
        }"#;
        let env = Envelope::from_json(json).expect("deserialize");
        match env.kind {
            MessageKind::Error { code, message } => {
                assert_eq!(code, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("expected error kind, got {:?}", other),
        }
    }

    #[test]
    fn segment_roundtrip() {
        let seg = Segment::List(vec![
            Segment::Text("hi".to_string()),
            Segment::ImageUrl("https://example.com/a.png".to_string()),
        ]);
        let json = serde_json::to_string(&seg).expect("serialize");
        assert!(json.contains(r#""type":"seglist""#));
        let parsed: Segment = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, seg);
    }

    #[test]
    fn unknown_segment_kind_is_tolerated() {
        let parsed: Segment =
            serde_json::from_str(r#"{"type":"sticker","data":"abc"}"#).expect("deserialize");
        assert_eq!(
            parsed,
            Segment::Unknown {
                kind: "sticker".to_string()
            }
        );
    }

    #[test]
    fn numeric_reply_data_is_accepted() {
        let parsed: Segment =
            serde_json::from_str(r#"{"type":"reply","data":42}"#).expect("deserialize");
        assert_eq!(parsed, Segment::Reply("42".to_string()));
    }

    #[test]
    fn flatten_preserves_depth_first_order() {
        let seg = Segment::List(vec![
            Segment::Text("a".to_string()),
            Segment::List(vec![
                Segment::Image("b".to_string()),
                Segment::Text("c".to_string()),
            ]),
        ]);
        let flat = seg.flatten();
        assert_eq!(
            flat,
            vec![
                Segment::Text("a".to_string()),
                Segment::Image("b".to_string()),
                Segment::Text("c".to_string()),
            ]
        );
    }

    #[test]
    fn flatten_survives_deep_nesting() {
        let mut seg = Segment::Text("leaf".to_string());
        for _ in 0..20_000 {
            seg = Segment::List(vec![seg]);
        }
        let flat = seg.flatten();
        assert_eq!(flat, vec![Segment::Text("leaf".to_string())]);
    }

    #[test]
    fn outbound_message_defaults_optional_routing_fields() {
        let json = r#"{
            "channel": "telegram",
            "segment": {"type": "text", "data": "hello"}
        }"#;
        let msg = OutboundMessage::from_json(json).expect("deserialize");
        assert_eq!(msg.group_id, None);
        assert_eq!(msg.user_id, None);
        assert_eq!(msg.chat_hint, None);
        assert_eq!(msg.reply_to, None);
        assert_eq!(msg.segment, Segment::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn event_bus_delivers_published_envelopes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Envelope::new("telegram", text_message()))
            .expect("publish");
        let env = rx.recv().await.expect("recv");
        assert_eq!(env.channel, "telegram");
    }
}
