use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use switchboard_agent::MessageBus;
use switchboard_core::config::SlackConfig;
use switchboard_core::{Attachment, ChatType, Error, OutboundMessage, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::base::{AllowList, BaseChannel};
use crate::util::{split_message, DedupSet};
use crate::{Channel, ChannelState};

pub const EVENTS_PATH: &str = "/slack/events";

const MAX_MESSAGE_CHARS: usize = 4000;
const AUTH_ERRORS: [&str; 4] = ["invalid_auth", "not_authed", "token_revoked", "account_inactive"];

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event: Option<SlackEventPayload>,
}

#[derive(Debug, Deserialize)]
struct SlackEventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url_private_download: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
}

#[derive(Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
}

/// Slack Events API channel: an HTTP endpoint for events plus the Web API
/// for replies.
pub struct SlackChannel {
    base: BaseChannel,
    config: SlackConfig,
    client: Client,
    bot_user_id: StdMutex<Option<String>>,
    seen: StdMutex<DedupSet>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl SlackChannel {
    pub fn new(config: SlackConfig, allow_list: AllowList, bus: MessageBus) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base: BaseChannel::new("slack", allow_list, bus),
            config,
            client,
            bot_user_id: StdMutex::new(None),
            seen: StdMutex::new(DedupSet::new(1000)),
            local_addr: StdMutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), method)
    }

    fn check(resp: SlackResponse, method: &str) -> Result<SlackResponse> {
        if resp.ok {
            return Ok(resp);
        }
        let err = resp.error.unwrap_or_else(|| "unknown_error".to_string());
        if AUTH_ERRORS.contains(&err.as_str()) {
            Err(Error::Auth(format!("Slack {} rejected the bot token: {}", method, err)))
        } else {
            Err(Error::Transport(format!("Slack {} failed: {}", method, err)))
        }
    }

    async fn auth_test(&self) -> Result<String> {
        let resp: SlackResponse = self
            .client
            .post(self.api_url("auth.test"))
            .bearer_auth(&self.config.bot_token)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Slack auth.test failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse Slack response: {}", e)))?;
        let resp = Self::check(resp, "auth.test")?;
        info!(bot = resp.user.as_deref().unwrap_or(""), "Slack bot authenticated");
        Ok(resp.user_id.unwrap_or_default())
    }

    async fn process_event(&self, raw_body: &str) -> Result<Value> {
        let envelope: EventEnvelope = serde_json::from_str(raw_body)
            .map_err(|e| Error::Validation(format!("Slack event JSON parse error: {}", e)))?;

        if !self.config.verification_token.is_empty()
            && envelope.token.as_deref() != Some(self.config.verification_token.as_str())
        {
            return Err(Error::Auth("Slack verification token mismatch".to_string()));
        }

        match envelope.envelope_type.as_str() {
            "url_verification" => {
                info!("Slack URL verification challenge received");
                return Ok(json!({ "challenge": envelope.challenge.unwrap_or_default() }));
            }
            "event_callback" => {}
            other => {
                debug!(envelope_type = %other, "Ignoring Slack envelope");
                return Ok(json!({}));
            }
        }

        if let Some(id) = envelope.event_id.as_deref() {
            if self.seen.lock().unwrap_or_else(|e| e.into_inner()).check_and_insert(id) {
                debug!(event_id = %id, "Duplicate Slack event (retry), skipping");
                return Ok(json!({}));
            }
        }

        let event = match envelope.event {
            Some(e) if e.event_type == "message" => e,
            _ => return Ok(json!({})),
        };
        // Edits, joins and bot posts carry a subtype; uploads are `file_share`.
        if event.bot_id.is_some() || event.subtype.as_deref().is_some_and(|s| s != "file_share") {
            return Ok(json!({}));
        }
        let (user, channel) = match (event.user.as_deref(), event.channel.as_deref()) {
            (Some(u), Some(c)) => (u, c),
            _ => return Ok(json!({})),
        };
        let is_self = self
            .bot_user_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .is_some_and(|id| id == user);
        if is_self {
            return Ok(json!({}));
        }
        if !self.base.allow_list().allows(user) {
            info!(channel = "slack", sender = %user, "Sender not in allow list, dropping message");
            return Ok(json!({}));
        }

        let mut attachments = Vec::new();
        for file in &event.files {
            let Some(url) = file.url_private_download.as_deref() else {
                continue;
            };
            match self.download(url).await {
                Ok(data) => attachments.push(Attachment::new(
                    file.mimetype
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    file.name.clone().unwrap_or_else(|| "file".to_string()),
                    data,
                )),
                Err(e) => error!(error = %e, "Failed to download Slack file"),
            }
        }

        let chat_type = if event.channel_type.as_deref() == Some("im") {
            ChatType::Direct
        } else {
            ChatType::Group
        };
        let mut metadata = BTreeMap::new();
        if let Some(ts) = &event.ts {
            metadata.insert("message_id".to_string(), ts.clone());
            if let Some(secs) = ts.split('.').next() {
                metadata.insert("timestamp".to_string(), secs.to_string());
            }
        }
        if let Some(thread) = &event.thread_ts {
            metadata.insert("thread_ts".to_string(), thread.clone());
        }

        self.base
            .handle_message(
                user,
                channel,
                event.text.as_deref().unwrap_or(""),
                attachments,
                metadata,
                chat_type,
            )
            .await?;
        Ok(json!({}))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.bot_token)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Slack file download failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Transport(format!("Slack file download failed: {}", resp.status())));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Slack file read failed: {}", e)))?
            .to_vec())
    }

    async fn post_message(&self, channel: &str, text: &str, thread_ts: Option<&str>) -> Result<()> {
        let resp: SlackResponse = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(&self.config.bot_token)
            .json(&PostMessage { channel, text, thread_ts })
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to send Slack message: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse Slack response: {}", e)))?;
        Self::check(resp, "chat.postMessage")?;
        Ok(())
    }

    async fn upload_file(&self, channel: &str, attachment: &Attachment, thread_ts: Option<&str>) -> Result<()> {
        let part = Part::bytes(attachment.data.clone())
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.mime)
            .map_err(|e| Error::Validation(format!("Invalid MIME type '{}': {}", attachment.mime, e)))?;
        let mut form = Form::new()
            .text("channels", channel.to_string())
            .text("filename", attachment.filename.clone())
            .part("file", part);
        if let Some(ts) = thread_ts {
            form = form.text("thread_ts", ts.to_string());
        }

        let resp: SlackResponse = self
            .client
            .post(self.api_url("files.upload"))
            .bearer_auth(&self.config.bot_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to upload Slack file: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse Slack response: {}", e)))?;
        Self::check(resp, "files.upload")?;
        Ok(())
    }
}

async fn events_handler(State(channel): State<Arc<SlackChannel>>, body: String) -> (StatusCode, Json<Value>) {
    match channel.process_event(&body).await {
        Ok(resp) => (StatusCode::OK, Json(resp)),
        Err(Error::Auth(msg)) => {
            warn!(error = %msg, "Rejected Slack event");
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg })))
        }
        Err(Error::Closed(msg)) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": msg }))),
        Err(e) => {
            warn!(error = %e, "Bad Slack event");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn base(&self) -> &BaseChannel {
        &self.base
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let _guard = self.base.lifecycle().await;
        if self.base.running() {
            return Ok(());
        }
        if self.config.bot_token.is_empty() {
            self.base.set_state(ChannelState::Failed);
            return Err(Error::Config("Slack bot token not configured".to_string()));
        }

        self.base.set_state(ChannelState::Starting);
        match self.auth_test().await {
            Ok(user_id) => {
                *self.bot_user_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(user_id);
            }
            Err(e) => {
                self.base.set_state(if matches!(e, Error::Auth(_)) {
                    ChannelState::LoggedOut
                } else {
                    ChannelState::Failed
                });
                return Err(e);
            }
        }

        let addr = format!("{}:{}", self.config.listen_host, self.config.listen_port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                self.base.set_state(ChannelState::Failed);
                return Err(Error::Resource(format!("Failed to bind Slack events endpoint on {}: {}", addr, e)));
            }
        };
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);

        let run = self.base.begin(&cancel);
        let app = Router::new()
            .route(EVENTS_PATH, post(events_handler))
            .with_state(Arc::clone(&self));
        self.base.spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { run.cancelled().await })
                .await
            {
                error!(error = %e, "Slack events server failed");
            }
        });

        self.base.set_state(ChannelState::Running);
        info!(addr = %bound, path = EVENTS_PATH, "Slack events endpoint listening");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let thread_ts = msg.reply_to_message_id.as_deref();
        if !msg.content.is_empty() {
            for chunk in split_message(&msg.content, MAX_MESSAGE_CHARS) {
                self.post_message(&msg.chat_id, &chunk, thread_ts).await?;
            }
        }
        for attachment in &msg.attachments {
            self.upload_file(&msg.chat_id, attachment, thread_ts).await?;
        }
        Ok(())
    }
}
