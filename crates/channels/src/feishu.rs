//! Feishu (Lark) bot channel.
//!
//! Inbound events arrive on an HTTP endpoint owned by the adapter:
//!   1. URL verification: `{"type":"url_verification","challenge":"..."}` is
//!      answered with `{"challenge":"..."}`.
//!   2. Encrypted bodies `{"encrypt":"..."}` are decrypted with the configured
//!      encrypt key and processed as plain events.
//!   3. `im.message.receive_v1` events are deduplicated by `event_id` and
//!      published to the bus.
//!
//! Outbound messages use the tenant access token, cached for two hours.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use switchboard_agent::MessageBus;
use switchboard_core::config::FeishuConfig;
use switchboard_core::{Attachment, ChatType, Error, OutboundMessage, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::base::{AllowList, BaseChannel};
use crate::util::DedupSet;
use crate::{Channel, ChannelState};

pub const WEBHOOK_PATH: &str = "/feishu/events";

const TOKEN_LIFETIME_SECS: i64 = 7200;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
/// Feishu API codes for an invalid or expired tenant token.
const INVALID_TOKEN_CODES: [i64; 2] = [99991661, 99991663];

#[derive(Debug, Default)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        !self.token.is_empty() && chrono::Utc::now().timestamp() < self.expires_at - TOKEN_REFRESH_MARGIN_SECS
    }
}

/// Top-level webhook body, encrypted or plain.
#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    encrypt: Option<String>,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    /// Verification token on url_verification bodies.
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    header: Option<EventHeader>,
    #[serde(default)]
    event: Option<EventBody>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    event_id: String,
    event_type: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    create_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventBody {
    #[serde(default)]
    message: Option<MessageEvent>,
    #[serde(default)]
    sender: Option<SenderInfo>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    message_id: String,
    chat_id: String,
    #[serde(default)]
    chat_type: String,
    message_type: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct SenderInfo {
    #[serde(default)]
    sender_id: Option<SenderId>,
    #[serde(default)]
    sender_type: String,
}

#[derive(Debug, Deserialize)]
struct SenderId {
    open_id: String,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageContent {
    #[serde(default)]
    image_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostContent {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Vec<Vec<PostElement>>,
}

#[derive(Debug, Deserialize)]
struct PostElement {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    tenant_access_token: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    receive_id: &'a str,
    msg_type: &'a str,
    content: String,
}

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Decrypt an encrypted webhook body.
///
///   key  = SHA-256(encrypt_key)
///   iv   = first 16 bytes of the base64-decoded payload
///   data = remaining bytes (AES-256-CBC + PKCS7)
fn decrypt_event(encrypt_key: &str, encrypted_b64: &str) -> Result<String> {
    let key_bytes: [u8; 32] = Sha256::digest(encrypt_key.as_bytes()).into();

    let raw = B64
        .decode(encrypted_b64)
        .map_err(|e| Error::Validation(format!("Feishu webhook base64 decode failed: {}", e)))?;
    if raw.len() < 16 {
        return Err(Error::Validation("Feishu webhook encrypted payload too short".to_string()));
    }

    let (iv, ciphertext) = raw.split_at(16);
    let iv: [u8; 16] = iv
        .try_into()
        .map_err(|_| Error::Validation("Feishu webhook IV length error".to_string()))?;

    let mut buf = ciphertext.to_vec();
    let plaintext = Aes256CbcDec::new(&key_bytes.into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| Error::Validation(format!("Feishu webhook AES decrypt failed: {}", e)))?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|e| Error::Validation(format!("Feishu webhook plaintext UTF-8 error: {}", e)))
}

fn flatten_post(post: &PostContent) -> String {
    let mut lines = Vec::new();
    if let Some(title) = post.title.as_deref().filter(|t| !t.is_empty()) {
        lines.push(title.to_string());
    }
    for paragraph in &post.content {
        let line: String = paragraph
            .iter()
            .filter_map(|el| el.text.clone().or_else(|| el.href.clone()))
            .collect();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Feishu bot channel: webhook receiver plus REST sender.
pub struct FeishuChannel {
    base: BaseChannel,
    config: FeishuConfig,
    client: Client,
    token: Mutex<CachedToken>,
    seen: StdMutex<DedupSet>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl FeishuChannel {
    pub fn new(config: FeishuConfig, allow_list: AllowList, bus: MessageBus) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base: BaseChannel::new("feishu", allow_list, bus),
            config,
            client,
            token: Mutex::new(CachedToken::default()),
            seen: StdMutex::new(DedupSet::new(1000)),
            local_addr: StdMutex::new(None),
        })
    }

    /// Address the webhook listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn fetch_tenant_token(&self) -> Result<String> {
        #[derive(Serialize)]
        struct TokenRequest<'a> {
            app_id: &'a str,
            app_secret: &'a str,
        }

        let resp = self
            .client
            .post(self.api_url("/auth/v3/tenant_access_token/internal"))
            .json(&TokenRequest {
                app_id: &self.config.app_id,
                app_secret: &self.config.app_secret,
            })
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Feishu token request failed: {}", e)))?;

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Feishu token response parse failed: {}", e)))?;
        if body.code != 0 {
            return Err(Error::Auth(format!("Feishu token error: {}", body.msg)));
        }
        body.tenant_access_token
            .ok_or_else(|| Error::Auth("No tenant_access_token in Feishu response".to_string()))
    }

    async fn tenant_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if guard.is_valid() {
            return Ok(guard.token.clone());
        }
        let token = self.fetch_tenant_token().await?;
        guard.token = token.clone();
        guard.expires_at = chrono::Utc::now().timestamp() + TOKEN_LIFETIME_SECS;
        debug!("Feishu tenant_access_token refreshed");
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = CachedToken::default();
    }

    /// Handles one webhook body; returns the JSON to answer with.
    async fn process_webhook(&self, raw_body: &str) -> Result<Value> {
        let parse = |raw: &str| -> Result<WebhookBody> {
            serde_json::from_str(raw)
                .map_err(|e| Error::Validation(format!("Feishu webhook JSON parse error: {}", e)))
        };
        let envelope = parse(raw_body)?;
        let body = match &envelope.encrypt {
            Some(encrypted) => {
                if self.config.encrypt_key.is_empty() {
                    return Err(Error::Validation(
                        "Feishu webhook received encrypted body but encrypt_key is not configured".to_string(),
                    ));
                }
                parse(&decrypt_event(&self.config.encrypt_key, encrypted)?)?
            }
            None => envelope,
        };

        let presented = body
            .token
            .as_deref()
            .or_else(|| body.header.as_ref().and_then(|h| h.token.as_deref()));
        if !self.config.verification_token.is_empty() && presented != Some(self.config.verification_token.as_str()) {
            return Err(Error::Auth("Feishu webhook verification token mismatch".to_string()));
        }

        if body.event_type.as_deref() == Some("url_verification") {
            info!("Feishu webhook URL verification challenge received");
            return Ok(json!({ "challenge": body.challenge.unwrap_or_default() }));
        }

        let ok = json!({ "code": 0 });
        let header = match body.header {
            Some(h) => h,
            None => return Ok(ok),
        };
        if header.event_type != "im.message.receive_v1" {
            debug!(event_type = %header.event_type, "Ignoring non-message Feishu event");
            return Ok(ok);
        }
        if self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check_and_insert(&header.event_id)
        {
            debug!(event_id = %header.event_id, "Duplicate Feishu event, skipping");
            return Ok(ok);
        }

        let event = match body.event {
            Some(e) => e,
            None => return Ok(ok),
        };
        if event.sender.as_ref().is_some_and(|s| s.sender_type == "bot") {
            return Ok(ok);
        }
        let message = match event.message {
            Some(m) => m,
            None => return Ok(ok),
        };
        let open_id = event
            .sender
            .as_ref()
            .and_then(|s| s.sender_id.as_ref())
            .map(|id| id.open_id.clone())
            .unwrap_or_default();
        if !self.base.allow_list().allows(&open_id) {
            info!(channel = "feishu", sender = %open_id, "Sender not in allow list, dropping message");
            return Ok(ok);
        }

        let mut attachments = Vec::new();
        let text = match message.message_type.as_str() {
            "text" => serde_json::from_str::<TextContent>(&message.content)
                .ok()
                .and_then(|c| c.text)
                .unwrap_or_default()
                .trim()
                .to_string(),
            "post" => serde_json::from_str::<PostContent>(&message.content)
                .map(|p| flatten_post(&p))
                .unwrap_or_default(),
            "image" => {
                if let Some(key) = serde_json::from_str::<ImageContent>(&message.content)
                    .ok()
                    .and_then(|c| c.image_key)
                {
                    match self.download_image(&message.message_id, &key).await {
                        Ok(data) => attachments.push(Attachment::new("image/png", format!("{}.png", key), data)),
                        Err(e) => error!(error = %e, "Failed to download Feishu image"),
                    }
                }
                String::new()
            }
            other => {
                debug!(message_type = %other, "Unsupported Feishu message type");
                return Ok(ok);
            }
        };

        let chat_type = if message.chat_type == "p2p" {
            ChatType::Direct
        } else {
            ChatType::Group
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("message_id".to_string(), message.message_id.clone());
        metadata.insert("event_id".to_string(), header.event_id.clone());
        if let Some(ms) = header.create_time.as_deref().and_then(|t| t.parse::<i64>().ok()) {
            metadata.insert("timestamp".to_string(), (ms / 1000).to_string());
        }

        self.base
            .handle_message(&open_id, &message.chat_id, &text, attachments, metadata, chat_type)
            .await?;
        Ok(ok)
    }

    async fn download_image(&self, message_id: &str, image_key: &str) -> Result<Vec<u8>> {
        let token = self.tenant_token().await?;
        let resp = self
            .client
            .get(self.api_url(&format!("/im/v1/messages/{}/resources/{}", message_id, image_key)))
            .query(&[("type", "image")])
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Feishu resource download failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Transport(format!("Feishu resource download failed: {}", resp.status())));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Feishu resource read failed: {}", e)))?
            .to_vec())
    }

    async fn check_api(&self, resp: reqwest::Response, what: &str) -> Result<ApiResponse> {
        let status = resp.status();
        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Feishu {} response parse failed ({}): {}", what, status, e)))?;
        if INVALID_TOKEN_CODES.contains(&body.code) {
            self.invalidate_token().await;
            return Err(Error::Transport(format!("Feishu {} rejected token: {}", what, body.msg)));
        }
        if body.code != 0 {
            return Err(Error::Transport(format!("Feishu {} error {}: {}", what, body.code, body.msg)));
        }
        Ok(body)
    }

    async fn post_message(&self, chat_id: &str, msg_type: &str, content: Value) -> Result<()> {
        let token = self.tenant_token().await?;
        let resp = self
            .client
            .post(self.api_url("/im/v1/messages"))
            .query(&[("receive_id_type", "chat_id")])
            .header("Authorization", format!("Bearer {}", token))
            .json(&SendRequest {
                receive_id: chat_id,
                msg_type,
                content: content.to_string(),
            })
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Feishu send request failed: {}", e)))?;
        self.check_api(resp, "send").await?;
        Ok(())
    }

    /// Uploads an attachment and returns `(msg_type, content)` to send it with.
    async fn upload(&self, attachment: &Attachment) -> Result<(&'static str, Value)> {
        let token = self.tenant_token().await?;
        let part = Part::bytes(attachment.data.clone())
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.mime)
            .map_err(|e| Error::Validation(format!("Invalid MIME type '{}': {}", attachment.mime, e)))?;

        let is_image = attachment.mime.starts_with("image/");
        let (path, form) = if is_image {
            ("/im/v1/images", Form::new().text("image_type", "message").part("image", part))
        } else {
            (
                "/im/v1/files",
                Form::new()
                    .text("file_type", "stream")
                    .text("file_name", attachment.filename.clone())
                    .part("file", part),
            )
        };

        let resp = self
            .client
            .post(self.api_url(path))
            .header("Authorization", format!("Bearer {}", token))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Feishu upload failed: {}", e)))?;
        let body = self.check_api(resp, "upload").await?;
        let data = body.data.unwrap_or_default();

        if is_image {
            let key = data["image_key"].as_str().unwrap_or_default().to_string();
            Ok(("image", json!({ "image_key": key })))
        } else {
            let key = data["file_key"].as_str().unwrap_or_default().to_string();
            Ok(("file", json!({ "file_key": key })))
        }
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(WEBHOOK_PATH, post(webhook_handler))
            .with_state(self)
    }
}

async fn webhook_handler(State(channel): State<Arc<FeishuChannel>>, body: String) -> (StatusCode, Json<Value>) {
    match channel.process_webhook(&body).await {
        Ok(resp) => (StatusCode::OK, Json(resp)),
        Err(Error::Auth(msg)) => {
            warn!(error = %msg, "Rejected Feishu webhook");
            (StatusCode::UNAUTHORIZED, Json(json!({ "code": 401, "msg": msg })))
        }
        Err(Error::Closed(msg)) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "code": 503, "msg": msg }))),
        Err(e) => {
            warn!(error = %e, "Bad Feishu webhook");
            (StatusCode::BAD_REQUEST, Json(json!({ "code": 400, "msg": e.to_string() })))
        }
    }
}

#[async_trait]
impl Channel for FeishuChannel {
    fn base(&self) -> &BaseChannel {
        &self.base
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let _guard = self.base.lifecycle().await;
        if self.base.running() {
            return Ok(());
        }
        if self.config.app_id.is_empty() || self.config.app_secret.is_empty() {
            self.base.set_state(ChannelState::Failed);
            return Err(Error::Config("Feishu app_id/app_secret not configured".to_string()));
        }

        self.base.set_state(ChannelState::Starting);
        if let Err(e) = self.tenant_token().await {
            self.base.set_state(if matches!(e, Error::Auth(_)) {
                ChannelState::LoggedOut
            } else {
                ChannelState::Failed
            });
            return Err(e);
        }

        let addr = format!("{}:{}", self.config.listen_host, self.config.listen_port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                self.base.set_state(ChannelState::Failed);
                return Err(Error::Resource(format!("Failed to bind Feishu webhook on {}: {}", addr, e)));
            }
        };
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);

        let run = self.base.begin(&cancel);
        let app = Arc::clone(&self).router();
        self.base.spawn(async move {
            let shutdown = run.clone();
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!(error = %e, "Feishu webhook server failed");
            }
        });

        self.base.set_state(ChannelState::Running);
        info!(addr = %bound, path = WEBHOOK_PATH, "Feishu webhook listening");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        if !msg.content.is_empty() {
            self.post_message(&msg.chat_id, "text", json!({ "text": msg.content }))
                .await?;
        }
        for attachment in &msg.attachments {
            let (msg_type, content) = self.upload(attachment).await?;
            self.post_message(&msg.chat_id, msg_type, content).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, Recorder};
    use aes::cipher::BlockEncryptMut;
    use axum::http::HeaderMap;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    fn encrypt(key: &str, plaintext: &str) -> String {
        let key_bytes: [u8; 32] = Sha256::digest(key.as_bytes()).into();
        let iv = [7u8; 16];
        let ct = Aes256CbcEnc::new(&key_bytes.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        let mut raw = iv.to_vec();
        raw.extend_from_slice(&ct);
        B64.encode(raw)
    }

    fn fake_api(sent: Recorder) -> Router {
        Router::new()
            .route(
                "/auth/v3/tenant_access_token/internal",
                post(|Json(body): Json<Value>| async move {
                    if body["app_secret"] == "secret" {
                        Json(json!({"code": 0, "msg": "ok", "tenant_access_token": "t-123", "expire": 7200}))
                    } else {
                        Json(json!({"code": 10014, "msg": "app secret invalid"}))
                    }
                }),
            )
            .route(
                "/im/v1/messages",
                post(|State(sent): State<Recorder>, headers: HeaderMap, Json(mut body): Json<Value>| async move {
                    body["auth"] = json!(headers.get("authorization").and_then(|v| v.to_str().ok()));
                    sent.push(body);
                    Json(json!({"code": 0, "msg": "success", "data": {}}))
                }),
            )
            .with_state(sent)
    }

    fn channel(api: &str, secret: &str, allow: &[&str], bus: MessageBus) -> Arc<FeishuChannel> {
        let config = FeishuConfig {
            enabled: true,
            app_id: "cli_a".into(),
            app_secret: secret.into(),
            encrypt_key: "enc-key".into(),
            verification_token: "vt".into(),
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            api_base: api.into(),
            allow_from: Default::default(),
        };
        Arc::new(FeishuChannel::new(config, AllowList::new(allow.iter().copied()), bus).unwrap())
    }

    fn message_event(event_id: &str, sender: &str, sender_type: &str, text: &str) -> Value {
        json!({
            "schema": "2.0",
            "header": {"event_id": event_id, "event_type": "im.message.receive_v1", "token": "vt", "create_time": "1700000000000"},
            "event": {
                "sender": {"sender_id": {"open_id": sender}, "sender_type": sender_type},
                "message": {
                    "message_id": format!("om_{}", event_id),
                    "chat_id": "oc_1",
                    "chat_type": "p2p",
                    "message_type": "text",
                    "content": json!({"text": text}).to_string()
                }
            }
        })
    }

    #[test]
    fn test_cached_token_validity() {
        assert!(!CachedToken::default().is_valid());
        let fresh = CachedToken {
            token: "t".into(),
            expires_at: chrono::Utc::now().timestamp() + 3600,
        };
        assert!(fresh.is_valid());
        let near_expiry = CachedToken {
            token: "t".into(),
            expires_at: chrono::Utc::now().timestamp() + 60,
        };
        assert!(!near_expiry.is_valid());
    }

    #[test]
    fn test_decrypt_event() {
        let encrypted = encrypt("enc-key", r#"{"challenge":"c"}"#);
        assert_eq!(decrypt_event("enc-key", &encrypted).unwrap(), r#"{"challenge":"c"}"#);
        assert!(decrypt_event("other-key", &encrypted).is_err());
        assert!(decrypt_event("enc-key", "notbase64!!!").is_err());
    }

    #[test]
    fn test_flatten_post() {
        let post: PostContent = serde_json::from_value(json!({
            "title": "Weekly",
            "content": [[{"tag": "text", "text": "see "}, {"tag": "a", "href": "https://x"}], []]
        }))
        .unwrap();
        assert_eq!(flatten_post(&post), "Weekly\nsee https://x");
    }

    #[tokio::test]
    async fn test_encrypted_url_verification() {
        let ch = channel("http://127.0.0.1:9", "secret", &[], MessageBus::new(1));
        let plain = json!({"type": "url_verification", "challenge": "abc", "token": "vt"}).to_string();
        let body = json!({"encrypt": encrypt("enc-key", &plain)}).to_string();
        assert_eq!(ch.process_webhook(&body).await.unwrap(), json!({"challenge": "abc"}));

        let forged = json!({"type": "url_verification", "challenge": "abc", "token": "nope"}).to_string();
        assert!(matches!(ch.process_webhook(&forged).await, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_webhook_to_bus_and_reply() {
        let sent = Recorder::default();
        let api = serve(fake_api(sent.clone())).await;
        let bus = MessageBus::new(8);
        let mut inbound = bus.subscribe_inbound().unwrap();
        let ch = channel(&api, "secret", &["ou_alice"], bus);
        ch.clone().start(CancellationToken::new()).await.unwrap();
        assert!(ch.running());

        let url = format!("http://{}{}", ch.local_addr().unwrap(), WEBHOOK_PATH);
        let client = Client::new();
        for event in [
            message_event("e1", "ou_alice", "user", "hello"),
            message_event("e1", "ou_alice", "user", "hello"),
            message_event("e2", "ou_bot", "bot", "beep"),
            message_event("e3", "ou_mallory", "user", "let me in"),
        ] {
            let resp = client.post(&url).json(&event).send().await.unwrap();
            assert_eq!(resp.status(), 200);
        }
        let resp = client.post(&url).body("{not json").send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender_id, "ou_alice");
        assert_eq!(msg.chat_id, "oc_1");
        assert_eq!(msg.chat_type, ChatType::Direct);
        assert_eq!(msg.metadata.get("timestamp").map(String::as_str), Some("1700000000"));
        assert!(inbound.try_recv().is_err());

        ch.send(&OutboundMessage::reply_to(&msg, "hi alice")).await.unwrap();
        let sent = sent.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["receive_id"], "oc_1");
        assert_eq!(sent[0]["msg_type"], "text");
        assert_eq!(sent[0]["auth"], "Bearer t-123");
        let content: Value = serde_json::from_str(sent[0]["content"].as_str().unwrap()).unwrap();
        assert_eq!(content["text"], "hi alice");

        ch.stop().await.unwrap();
        assert!(!ch.running());
    }

    #[tokio::test]
    async fn test_bad_credentials_log_out() {
        let api = serve(fake_api(Recorder::default())).await;
        let ch = channel(&api, "wrong", &[], MessageBus::new(1));
        let err = ch.clone().start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(ch.state(), ChannelState::LoggedOut);
    }
}
