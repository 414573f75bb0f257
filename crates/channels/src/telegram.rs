use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_agent::MessageBus;
use switchboard_core::config::TelegramConfig;
use switchboard_core::{Attachment, ChatType, Error, OutboundMessage, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::base::{AllowList, BaseChannel};
use crate::util::split_message;
use crate::{Channel, ChannelState};

const MAX_MESSAGE_CHARS: usize = 4096;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    #[serde(default)]
    date: i64,
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<PhotoSize>>,
    voice: Option<Voice>,
    document: Option<Document>,
    reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    file_unique_id: String,
    width: i32,
    height: i32,
}

#[derive(Debug, Deserialize)]
struct Voice {
    file_id: String,
    file_unique_id: String,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Document {
    file_id: String,
    file_unique_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    username: Option<String>,
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type", default)]
    chat_type: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

/// Telegram Bot API over long-polling `getUpdates`.
pub struct TelegramChannel {
    base: BaseChannel,
    config: TelegramConfig,
    client: Client,
    poll_timeout_secs: u64,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, allow_list: AllowList, bus: MessageBus) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS + 30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base: BaseChannel::new("telegram", allow_list, bus),
            config,
            client,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
        })
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.token,
            method
        )
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Telegram request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            return Err(Error::Auth(format!("Telegram rejected the bot token ({})", status)));
        }

        let body: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse Telegram response: {}", e)))?;

        if !body.ok {
            return Err(Error::Transport(
                body.description.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }
        body.result
            .ok_or_else(|| Error::Transport("Telegram response without result".to_string()))
    }

    async fn get_me(&self) -> Result<String> {
        let me: User = self.call(self.client.get(self.api_url("getMe"))).await?;
        Ok(me.username.unwrap_or_else(|| me.id.to_string()))
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut params = vec![("timeout", self.poll_timeout_secs.to_string())];
        if let Some(off) = offset {
            params.push(("offset", off.to_string()));
        }
        self.call(self.client.get(self.api_url("getUpdates")).query(&params))
            .await
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut offset: Option<i64> = None;
        let mut backoff = Backoff::default();

        loop {
            let result = tokio::select! {
                r = self.get_updates(offset) => r,
                _ = cancel.cancelled() => break,
            };
            match result {
                Ok(updates) => {
                    if backoff.attempt() > 0 {
                        info!("Telegram polling recovered");
                        self.base.set_state(ChannelState::Running);
                    }
                    backoff.reset();
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(message) = update.message {
                            if let Err(e) = self.handle_message(message).await {
                                error!(error = %e, "Failed to handle Telegram message");
                                if matches!(e, Error::Closed(_)) {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(Error::Auth(msg)) => {
                    error!(error = %msg, "Telegram token revoked, channel logged out");
                    self.base.set_state(ChannelState::LoggedOut);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempt(), "Failed to get Telegram updates");
                    self.base.set_state(ChannelState::Reconnecting);
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                }
            }
        }
        debug!("Telegram poll loop exited");
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file: FileResponse = self
            .call(self.client.get(self.api_url("getFile")).query(&[("file_id", file_id)]))
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| Error::Transport("No file path in response".to_string()))?;

        let url = format!(
            "{}/file/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.token,
            file_path
        );
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to download file: {}", e)))?
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read file data: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn collect_attachments(&self, message: &Message) -> Vec<Attachment> {
        let mut wanted: Vec<(String, String, String)> = Vec::new();
        if let Some(largest) = message
            .photo
            .as_ref()
            .and_then(|photos| photos.iter().max_by_key(|p| p.width * p.height))
        {
            wanted.push((
                largest.file_id.clone(),
                format!("photo_{}_{}.jpg", message.message_id, largest.file_unique_id),
                "image/jpeg".to_string(),
            ));
        }
        if let Some(voice) = &message.voice {
            wanted.push((
                voice.file_id.clone(),
                format!("voice_{}_{}.ogg", message.message_id, voice.file_unique_id),
                voice.mime_type.clone().unwrap_or_else(|| "audio/ogg".to_string()),
            ));
        }
        if let Some(doc) = &message.document {
            wanted.push((
                doc.file_id.clone(),
                doc.file_name
                    .clone()
                    .unwrap_or_else(|| format!("doc_{}_{}", message.message_id, doc.file_unique_id)),
                doc.mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            ));
        }

        let mut attachments = Vec::new();
        for (file_id, filename, mime) in wanted {
            match self.download_file(&file_id).await {
                Ok(data) => {
                    debug!(file = %filename, bytes = data.len(), "Downloaded Telegram file");
                    attachments.push(Attachment::new(mime, filename, data));
                }
                Err(e) => error!(error = %e, file = %filename, "Failed to download Telegram file"),
            }
        }
        attachments
    }

    async fn handle_message(&self, message: Message) -> Result<()> {
        let user = match &message.from {
            Some(u) if !u.is_bot => u,
            _ => return Ok(()),
        };
        let sender_id = user.id.to_string();

        let username = user.username.as_deref();
        let aliases: Vec<&str> = username.into_iter().collect();

        // Cheap reject before downloading anything.
        if !self
            .base
            .allow_list()
            .allows_any(std::iter::once(sender_id.as_str()).chain(aliases.iter().copied()))
        {
            info!(channel = "telegram", sender = %sender_id, "Sender not in allow list, dropping message");
            return Ok(());
        }

        let content = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .unwrap_or_default();
        let attachments = self.collect_attachments(&message).await;

        let chat_type = if message.chat.chat_type == "private" {
            ChatType::Direct
        } else {
            ChatType::Group
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("message_id".to_string(), message.message_id.to_string());
        if message.date > 0 {
            metadata.insert("timestamp".to_string(), message.date.to_string());
        }
        if let Some(name) = user.username.as_ref().or(user.first_name.as_ref()) {
            metadata.insert("user_name".to_string(), name.clone());
        }
        if let Some(reply) = &message.reply_to_message {
            metadata.insert("reply_to".to_string(), reply.message_id.to_string());
        }

        self.base
            .handle_message_with_aliases(
                &sender_id,
                &aliases,
                &message.chat.id.to_string(),
                &content,
                attachments,
                metadata,
                chat_type,
            )
            .await?;
        Ok(())
    }

    async fn send_document(&self, chat_id: &str, attachment: &Attachment) -> Result<()> {
        let part = Part::bytes(attachment.data.clone())
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.mime)
            .map_err(|e| Error::Validation(format!("Invalid MIME type '{}': {}", attachment.mime, e)))?;
        let form = Form::new().text("chat_id", chat_id.to_string()).part("document", part);

        let _: serde_json::Value = self
            .call(self.client.post(self.api_url("sendDocument")).multipart(form))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn base(&self) -> &BaseChannel {
        &self.base
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let _guard = self.base.lifecycle().await;
        if self.base.running() {
            return Ok(());
        }
        if self.config.token.is_empty() {
            self.base.set_state(ChannelState::Failed);
            return Err(Error::Config("Telegram token not configured".to_string()));
        }

        self.base.set_state(ChannelState::Starting);
        match self.get_me().await {
            Ok(username) => info!(bot = %username, "Telegram bot authenticated"),
            Err(e) => {
                let state = if matches!(e, Error::Auth(_)) {
                    ChannelState::LoggedOut
                } else {
                    ChannelState::Failed
                };
                self.base.set_state(state);
                return Err(e);
            }
        }

        let run = self.base.begin(&cancel);
        self.base.set_state(ChannelState::Running);
        let this = Arc::clone(&self);
        self.base.spawn(this.poll_loop(run));
        info!("Telegram channel started");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let reply_to = msg
            .reply_to_message_id
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok());

        if !msg.content.is_empty() {
            for (i, chunk) in split_message(&msg.content, MAX_MESSAGE_CHARS).iter().enumerate() {
                let request = SendMessageRequest {
                    chat_id: &msg.chat_id,
                    text: chunk,
                    reply_to_message_id: if i == 0 { reply_to } else { None },
                };
                let _: serde_json::Value = self
                    .call(self.client.post(self.api_url("sendMessage")).json(&request))
                    .await?;
            }
        }
        for attachment in &msg.attachments {
            self.send_document(&msg.chat_id, attachment).await?;
        }
        debug!(chat_id = %msg.chat_id, "Telegram message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, Recorder};
    use axum::extract::{Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct FakeTelegram {
        sent: Recorder,
        polls: Arc<AtomicUsize>,
        /// `getMe` calls answered with 502 before the server recovers.
        me_outages: Arc<AtomicUsize>,
        me_calls: Arc<AtomicUsize>,
    }

    fn update(id: i64, from: i64, chat_type: &str, text: &str) -> Value {
        json!({
            "update_id": id,
            "message": {
                "message_id": id * 10,
                "date": 1700000000,
                "from": {"id": from, "is_bot": false, "username": format!("user{}", from)},
                "chat": {"id": from, "type": chat_type},
                "text": text
            }
        })
    }

    async fn get_updates(State(s): State<FakeTelegram>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        let n = s.polls.fetch_add(1, Ordering::SeqCst);
        if n == 0 && !q.contains_key("offset") {
            return Json(json!({"ok": true, "result": [
                update(1, 7, "private", "from stranger"),
                update(2, 42, "private", "hi"),
                update(3, 42, "group", "   "),
            ]}));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Json(json!({"ok": true, "result": []}))
    }

    async fn get_me(State(s): State<FakeTelegram>) -> axum::response::Response {
        use axum::response::IntoResponse;
        let n = s.me_calls.fetch_add(1, Ordering::SeqCst);
        if n < s.me_outages.load(Ordering::SeqCst) {
            return (StatusCode::BAD_GATEWAY, "upstream down").into_response();
        }
        Json(json!({"ok": true, "result": {"id": 1, "is_bot": true, "username": "sb_bot"}})).into_response()
    }

    fn router(state: FakeTelegram) -> Router {
        Router::new()
            .route("/botT/getMe", get(get_me))
            .route("/botT/getUpdates", get(get_updates))
            .route(
                "/botT/sendMessage",
                post(|State(s): State<FakeTelegram>, Json(body): Json<Value>| async move {
                    s.sent.push(body);
                    Json(json!({"ok": true, "result": {"message_id": 99}}))
                }),
            )
            .route("/botBAD/getMe", get(|| async { (StatusCode::UNAUTHORIZED, "Unauthorized") }))
            .with_state(state)
    }

    fn channel(base_url: &str, token: &str, allow: &[&str], bus: MessageBus) -> Arc<TelegramChannel> {
        let config = TelegramConfig {
            enabled: true,
            token: token.to_string(),
            allow_from: Default::default(),
            api_base: base_url.to_string(),
        };
        Arc::new(
            TelegramChannel::new(config, AllowList::new(allow.iter().copied()), bus)
                .unwrap()
                .with_poll_timeout(1),
        )
    }

    #[tokio::test]
    async fn test_poll_publishes_allowed_messages_only() {
        let fake = FakeTelegram::default();
        let url = serve(router(fake.clone())).await;
        let bus = MessageBus::new(8);
        let mut inbound = bus.subscribe_inbound().unwrap();
        let ch = channel(&url, "T", &["42"], bus);

        let cancel = CancellationToken::new();
        ch.clone().start(cancel.clone()).await.unwrap();
        assert!(ch.running());

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender_id, "42");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.chat_type, ChatType::Direct);
        assert_eq!(msg.message_id(), Some("20"));
        assert_eq!(msg.metadata.get("user_name").map(String::as_str), Some("user42"));

        ch.stop().await.unwrap();
        assert!(!ch.running());
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_username_admission_keeps_numeric_sender() {
        let fake = FakeTelegram::default();
        let url = serve(router(fake.clone())).await;
        let bus = MessageBus::new(8);
        let mut inbound = bus.subscribe_inbound().unwrap();
        let ch = channel(&url, "T", &["user42"], bus);
        ch.clone().start(CancellationToken::new()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender_id, "42");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.session_key(), "telegram:42");
        assert_eq!(msg.metadata.get("user_name").map(String::as_str), Some("user42"));

        ch.stop().await.unwrap();
        // The stranger (user7) was not admitted.
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_splits_long_text_and_replies_to_first_chunk() {
        let fake = FakeTelegram::default();
        let url = serve(router(fake.clone())).await;
        let ch = channel(&url, "T", &[], MessageBus::new(1));

        let mut msg = OutboundMessage::new("telegram", "42", &"x".repeat(5000));
        msg.reply_to_message_id = Some("20".into());
        ch.send(&msg).await.unwrap();

        let sent = fake.sent.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["chat_id"], "42");
        assert_eq!(sent[0]["reply_to_message_id"], 20);
        assert_eq!(sent[0]["text"].as_str().unwrap().chars().count(), 4096);
        assert!(sent[1].get("reply_to_message_id").is_none());
    }

    #[tokio::test]
    async fn test_rejected_token_is_auth_error() {
        let url = serve(router(FakeTelegram::default())).await;
        let ch = channel(&url, "BAD", &[], MessageBus::new(1));
        let err = ch.clone().start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(ch.state(), ChannelState::LoggedOut);
        assert!(!ch.running());
    }

    #[tokio::test]
    async fn test_start_recovers_from_transient_outage() {
        let fake = FakeTelegram::default();
        fake.me_outages.store(1, Ordering::SeqCst);
        let url = serve(router(fake.clone())).await;
        let ch = channel(&url, "T", &[], MessageBus::new(8));

        let err = ch.clone().start(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(ch.state(), ChannelState::Failed);

        let cancel = CancellationToken::new();
        crate::ChannelManager::start_channel(
            ch.clone(),
            cancel.clone(),
            cancel.clone(),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert!(ch.running());
        assert_eq!(fake.me_calls.load(Ordering::SeqCst), 2);
        ch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_token_is_config_error() {
        let ch = channel("http://127.0.0.1:9", "", &[], MessageBus::new(1));
        assert!(matches!(
            ch.clone().start(CancellationToken::new()).await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_update_deserialize_with_photo() {
        let raw = json!({
            "update_id": 5,
            "message": {
                "message_id": 1, "date": 1,
                "from": {"id": 3, "is_bot": false},
                "chat": {"id": -100, "type": "supergroup"},
                "caption": "look",
                "photo": [
                    {"file_id": "s", "file_unique_id": "u1", "width": 90, "height": 90},
                    {"file_id": "l", "file_unique_id": "u2", "width": 800, "height": 600}
                ]
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.chat_type, "supergroup");
        let largest = msg.photo.as_ref().unwrap().iter().max_by_key(|p| p.width * p.height).unwrap();
        assert_eq!(largest.file_id, "l");
    }
}
