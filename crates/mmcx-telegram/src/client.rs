//! Telegram Bot API client.
//!
//! Every call returns an [`ApiReply`]: a malformed or non-JSON HTTP body is
//! converted into a synthetic failure, never an `Err`. `Err` is reserved for
//! actual network-level failures (connect, DNS, timeout), which the callers
//! retry or log according to their own policy.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use mmcx_config::TelegramConfig;

/// Outcome of one Bot API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply {
    Ok {
        result: Value,
    },
    Failure {
        description: String,
        status: Option<u16>,
        raw: Option<String>,
    },
}

impl ApiReply {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiReply::Ok { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            ApiReply::Ok { result } => Some(result),
            ApiReply::Failure { .. } => None,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            ApiReply::Ok { .. } => None,
            ApiReply::Failure { description, .. } => Some(description),
        }
    }

    /// `result.message_id` of a successful send, if present.
    pub fn message_id(&self) -> Option<i64> {
        self.result()?.get("message_id")?.as_i64()
    }

    fn failure(description: impl Into<String>, status: u16, raw: &str) -> Self {
        ApiReply::Failure {
            description: description.into(),
            status: Some(status),
            raw: if raw.is_empty() {
                None
            } else {
                Some(raw.to_string())
            },
        }
    }

    /// Interpret an HTTP body as a Bot API reply. Anything that is not an
    /// `{ok: ...}` JSON object becomes a synthetic failure.
    pub fn from_body(status: u16, body: &str) -> Self {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => return Self::failure("invalid json response", status, body),
        };
        let Some(obj) = parsed.as_object() else {
            return Self::failure("non-object json response", status, body);
        };
        if obj.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            ApiReply::Ok {
                result: obj.get("result").cloned().unwrap_or(Value::Null),
            }
        } else {
            let description = obj
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description")
                .to_string();
            Self::failure(description, status, body)
        }
    }

    async fn read(resp: reqwest::Response) -> Self {
        let status = resp.status().as_u16();
        match resp.text().await {
            Ok(body) => Self::from_body(status, &body),
            Err(e) => Self::failure(format!("failed to read response body: {e}"), status, ""),
        }
    }
}

/// A concrete send destination: a numeric chat id or an `@name` handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Id(i64),
    Name(String),
}

impl ChatTarget {
    pub fn id(&self) -> Option<i64> {
        match self {
            ChatTarget::Id(id) => Some(*id),
            ChatTarget::Name(_) => None,
        }
    }

    fn as_json(&self) -> Value {
        match self {
            ChatTarget::Id(id) => json!(id),
            ChatTarget::Name(name) => json!(name),
        }
    }

    fn form_value(&self) -> String {
        match self {
            ChatTarget::Id(id) => id.to_string(),
            ChatTarget::Name(name) => name.clone(),
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatTarget::Id(id) => write!(f, "{}", id),
            ChatTarget::Name(name) => write!(f, "{}", name),
        }
    }
}

fn is_socks_proxy(proxy_url: &str) -> bool {
    url::Url::parse(proxy_url)
        .map(|u| u.scheme().starts_with("socks"))
        .unwrap_or(false)
}

/// The API sporadically rejects well-formed JSON sends of non-empty text with
/// this description; a form-encoded resend goes through. Only that exact
/// failure, for visibly non-blank text, earns the one retry.
pub(crate) fn should_retry_as_form(reply: &ApiReply, text: &str) -> bool {
    if reply.is_ok() || text.trim().is_empty() {
        return false;
    }
    reply
        .description()
        .map(|d| d.to_lowercase().contains("message text is empty"))
        .unwrap_or(false)
}

pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl TelegramClient {
    pub fn new(cfg: &TelegramConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30));

        if !cfg.proxy.trust_env {
            builder = builder.no_proxy();
        }
        if let Some(proxy_url) = cfg.proxy.active_url() {
            if is_socks_proxy(proxy_url) {
                info!("routing telegram traffic through SOCKS proxy");
            } else {
                info!("routing telegram traffic through HTTP proxy");
            }
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("invalid proxy url '{proxy_url}'"))?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            http: builder.build().context("failed to build HTTP client")?,
            token: cfg.bot_token.clone(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    pub async fn get_me(&self) -> Result<ApiReply> {
        let resp = self
            .http
            .get(self.url("getMe"))
            .send()
            .await
            .context("getMe request failed")?;
        Ok(ApiReply::read(resp).await)
    }

    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
        allowed_updates: &[String],
    ) -> Result<ApiReply> {
        let mut payload = json!({
            "timeout": timeout_secs,
            "allowed_updates": allowed_updates,
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let resp = self
            .http
            .post(self.url("getUpdates"))
            .json(&payload)
            .send()
            .await
            .context("getUpdates request failed")?;
        Ok(ApiReply::read(resp).await)
    }

    /// Send text, JSON body first. If the API claims "message text is empty"
    /// for visibly non-empty text, resend once as form parameters (chat id
    /// stringified, reply parameters embedded as a JSON string) and return
    /// that reply instead.
    pub async fn send_text(
        &self,
        chat: &ChatTarget,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<ApiReply> {
        let mut payload = json!({
            "chat_id": chat.as_json(),
            "text": text,
        });
        if let Some(message_id) = reply_to {
            payload["reply_parameters"] = json!({ "message_id": message_id });
        }

        let resp = self
            .http
            .post(self.url("sendMessage"))
            .json(&payload)
            .send()
            .await
            .context("sendMessage request failed")?;
        let first = ApiReply::read(resp).await;

        if !should_retry_as_form(&first, text) {
            return Ok(first);
        }

        warn!(
            chat = %chat,
            text_len = text.len(),
            "sendMessage(JSON) rejected as empty text, retrying as form"
        );

        let mut form: Vec<(&str, String)> = vec![
            ("chat_id", chat.form_value()),
            ("text", text.to_string()),
        ];
        if let Some(message_id) = reply_to {
            form.push((
                "reply_parameters",
                json!({ "message_id": message_id }).to_string(),
            ));
        }

        let resp = self
            .http
            .post(self.url("sendMessage"))
            .form(&form)
            .send()
            .await
            .context("sendMessage form retry failed")?;
        let retry = ApiReply::read(resp).await;

        if retry.is_ok() {
            warn!(chat = %chat, "sendMessage(JSON) failed but form retry succeeded");
        } else {
            error!(
                chat = %chat,
                first = ?first.description(),
                retry = ?retry.description(),
                "sendMessage failed in both JSON and form encodings"
            );
        }
        Ok(retry)
    }

    pub async fn send_photo_bytes(
        &self,
        chat: &ChatTarget,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        self.send_media_bytes("sendPhoto", "photo", "image.jpg", "image/jpeg", chat, bytes, caption)
            .await
    }

    pub async fn send_voice_bytes(
        &self,
        chat: &ChatTarget,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        self.send_media_bytes("sendVoice", "voice", "voice.ogg", "audio/ogg", chat, bytes, caption)
            .await
    }

    pub async fn send_animation_bytes(
        &self,
        chat: &ChatTarget,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        self.send_media_bytes(
            "sendAnimation",
            "animation",
            "animation.gif",
            "image/gif",
            chat,
            bytes,
            caption,
        )
        .await
    }

    pub async fn send_photo_url(
        &self,
        chat: &ChatTarget,
        url: &str,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        self.send_media_url("sendPhoto", "photo", chat, url, caption).await
    }

    pub async fn send_video_url(
        &self,
        chat: &ChatTarget,
        url: &str,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        self.send_media_url("sendVideo", "video", chat, url, caption).await
    }

    pub async fn send_document_url(
        &self,
        chat: &ChatTarget,
        url: &str,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        self.send_media_url("sendDocument", "document", chat, url, caption)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_media_bytes(
        &self,
        method: &str,
        field: &'static str,
        file_name: &str,
        mime: &str,
        chat: &ChatTarget,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .with_context(|| format!("{method} multipart error"))?;
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat.form_value())
            .part(field, part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        let resp = self
            .http
            .post(self.url(method))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;
        Ok(ApiReply::read(resp).await)
    }

    async fn send_media_url(
        &self,
        method: &str,
        field: &str,
        chat: &ChatTarget,
        url: &str,
        caption: Option<&str>,
    ) -> Result<ApiReply> {
        let mut payload = json!({
            "chat_id": chat.as_json(),
            (field): url,
        });
        if let Some(caption) = caption {
            payload["caption"] = json!(caption);
        }
        let resp = self
            .http
            .post(self.url(method))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;
        Ok(ApiReply::read(resp).await)
    }

    /// Resolve a file_id to the server-side path needed for download.
    pub async fn get_file_path(&self, file_id: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .post(self.url("getFile"))
            .json(&json!({ "file_id": file_id }))
            .send()
            .await
            .context("getFile request failed")?;
        let reply = ApiReply::read(resp).await;
        Ok(reply
            .result()
            .and_then(|r| r.get("file_path"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.file_url(file_path))
            .send()
            .await
            .context("file download request failed")?
            .error_for_status()
            .context("file download returned an error status")?;
        let bytes = resp
            .bytes()
            .await
            .context("failed to read downloaded file body")?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_body_parses_into_result() {
        let reply = ApiReply::from_body(200, r#"{"ok":true,"result":{"message_id":99}}"#);
        assert!(reply.is_ok());
        assert_eq!(reply.message_id(), Some(99));
    }

    #[test]
    fn error_body_keeps_description() {
        let reply = ApiReply::from_body(
            400,
            r#"{"ok":false,"description":"Bad Request: chat not found"}"#,
        );
        assert!(!reply.is_ok());
        assert_eq!(reply.description(), Some("Bad Request: chat not found"));
    }

    #[test]
    fn non_json_body_becomes_synthetic_failure() {
        let reply = ApiReply::from_body(502, "<html>Bad Gateway</html>");
        let ApiReply::Failure {
            description,
            status,
            raw,
        } = reply
        else {
            panic!("expected failure");
        };
        assert_eq!(description, "invalid json response");
        assert_eq!(status, Some(502));
        assert_eq!(raw.as_deref(), Some("<html>Bad Gateway</html>"));
    }

    #[test]
    fn non_object_json_becomes_synthetic_failure() {
        let reply = ApiReply::from_body(200, r#"[1,2,3]"#);
        assert_eq!(reply.description(), Some("non-object json response"));
    }

    #[test]
    fn empty_text_error_triggers_form_retry_for_visible_text() {
        let reply = ApiReply::from_body(
            400,
            r#"{"ok":false,"description":"Bad Request: MESSAGE TEXT IS EMPTY"}"#,
        );
        assert!(should_retry_as_form(&reply, "hello"));
    }

    #[test]
    fn blank_text_never_retries() {
        let reply = ApiReply::from_body(
            400,
            r#"{"ok":false,"description":"Bad Request: message text is empty"}"#,
        );
        assert!(!should_retry_as_form(&reply, "   \n\t"));
    }

    #[test]
    fn other_errors_never_retry() {
        let reply = ApiReply::from_body(
            400,
            r#"{"ok":false,"description":"Bad Request: chat not found"}"#,
        );
        assert!(!should_retry_as_form(&reply, "hello"));
        let ok = ApiReply::from_body(200, r#"{"ok":true,"result":{}}"#);
        assert!(!should_retry_as_form(&ok, "hello"));
    }

    #[test]
    fn socks_scheme_detection() {
        assert!(is_socks_proxy("socks5://127.0.0.1:1080"));
        assert!(is_socks_proxy("socks5h://host:1080"));
        assert!(!is_socks_proxy("http://127.0.0.1:8080"));
        assert!(!is_socks_proxy("not a url"));
    }

    #[test]
    fn chat_target_encodings() {
        let id = ChatTarget::Id(-100_123);
        assert_eq!(id.as_json(), serde_json::json!(-100_123));
        assert_eq!(id.form_value(), "-100123");
        assert_eq!(id.id(), Some(-100_123));

        let name = ChatTarget::Name("@bridge".to_string());
        assert_eq!(name.as_json(), serde_json::json!("@bridge"));
        assert_eq!(name.form_value(), "@bridge");
        assert_eq!(name.id(), None);
    }
}
