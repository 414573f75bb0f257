use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_agent::MessageBus;
use switchboard_core::config::DiscordConfig;
use switchboard_core::{Attachment, ChatType, Error, OutboundMessage, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::base::{AllowList, BaseChannel};
use crate::util::split_message;
use crate::{Channel, ChannelState};

const MAX_MESSAGE_CHARS: usize = 2000;

/// Discord Gateway opcodes
const GATEWAY_DISPATCH: u8 = 0;
const GATEWAY_HEARTBEAT: u8 = 1;
const GATEWAY_IDENTIFY: u8 = 2;
const GATEWAY_RECONNECT: u8 = 7;
const GATEWAY_INVALID_SESSION: u8 = 9;
const GATEWAY_HELLO: u8 = 10;
const GATEWAY_HEARTBEAT_ACK: u8 = 11;

/// Bound on HELLO and on READY after IDENTIFY.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code sent when the bot token is invalid.
const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Option<serde_json::Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayIdentify<'a> {
    op: u8,
    d: IdentifyData<'a>,
}

#[derive(Debug, Serialize)]
struct IdentifyData<'a> {
    token: &'a str,
    intents: u64,
    properties: IdentifyProperties,
}

#[derive(Debug, Serialize)]
struct IdentifyProperties {
    os: &'static str,
    browser: &'static str,
    device: &'static str,
}

#[derive(Debug, Serialize)]
struct GatewayHeartbeat {
    op: u8,
    d: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReadyEvent {
    user: DiscordUser,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: DiscordUser,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    filename: String,
    url: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Serialize)]
struct CreateMessage<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_reference: Option<MessageReference<'a>>,
}

#[derive(Serialize)]
struct MessageReference<'a> {
    message_id: &'a str,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A gateway connection that has completed IDENTIFY and received READY.
struct GatewaySession {
    write: SplitSink<WsStream, WsMessage>,
    read: SplitStream<WsStream>,
    heartbeat: Duration,
    sequence: Option<u64>,
}

/// Discord channel using the Gateway WebSocket for receiving messages and
/// the REST API for sending.
pub struct DiscordChannel {
    base: BaseChannel,
    config: DiscordConfig,
    client: Client,
    self_id: Mutex<Option<String>>,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig, allow_list: AllowList, bus: MessageBus) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base: BaseChannel::new("discord", allow_list, bus),
            config,
            client,
            self_id: Mutex::new(None),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.config.token)
    }

    fn check_status(status: StatusCode, body: &str) -> Result<()> {
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Auth(format!("Discord rejected the bot token: {}", body)));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("Discord API error ({}): {}", status, body)));
        }
        Ok(())
    }

    /// Get the Gateway WebSocket URL from Discord.
    async fn get_gateway_url(&self) -> Result<String> {
        let response = self
            .client
            .get(self.api_url("/gateway/bot"))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to get Discord gateway: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Self::check_status(status, &text)?;

        let body: serde_json::Value = serde_json::from_str(&text)?;
        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| format!("{}/?v=10&encoding=json", s.trim_end_matches('/')))
            .ok_or_else(|| Error::Transport("No gateway URL in response".to_string()))
    }

    async fn run_loop(self: Arc<Self>, first: GatewaySession, cancel: CancellationToken) {
        let mut backoff = Backoff::default();
        let mut ready = Some(first);

        loop {
            let session = match ready.take() {
                Some(session) => session,
                None => {
                    let connected = tokio::select! {
                        r = self.connect() => r,
                        _ = cancel.cancelled() => break,
                    };
                    match connected {
                        Ok(session) => session,
                        Err(e) => {
                            if self.on_session_error(e) {
                                break;
                            }
                            if !backoff.wait(&cancel).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };
            backoff.reset();
            self.base.set_state(ChannelState::Running);

            match self.run_session(session, &cancel).await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => {
                    info!("Discord gateway asked to reconnect");
                    self.base.set_state(ChannelState::Reconnecting);
                }
                Err(e) => {
                    if self.on_session_error(e) {
                        break;
                    }
                }
            }
            if !backoff.wait(&cancel).await {
                break;
            }
        }
        debug!("Discord gateway loop exited");
    }

    /// Returns `true` when the error is terminal.
    fn on_session_error(&self, e: Error) -> bool {
        match e {
            Error::Auth(msg) => {
                error!(error = %msg, "Discord token rejected, channel logged out");
                self.base.set_state(ChannelState::LoggedOut);
                true
            }
            other => {
                warn!(error = %other, "Discord connection error, reconnecting");
                self.base.set_state(ChannelState::Reconnecting);
                false
            }
        }
    }

    /// Fetches the gateway URL and runs HELLO, IDENTIFY and READY. The
    /// returned session is ready for events.
    async fn connect(&self) -> Result<GatewaySession> {
        let gateway_url = self.get_gateway_url().await?;
        let parsed = url::Url::parse(&gateway_url)
            .map_err(|e| Error::Config(format!("Invalid gateway URL: {}", e)))?;

        let (ws_stream, _) = connect_async(parsed.as_str())
            .await
            .map_err(|e| Error::Transport(format!("WebSocket connection failed: {}", e)))?;
        debug!(url = %gateway_url, "Connected to Discord Gateway");

        let (mut write, mut read) = ws_stream.split();

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next())
            .await
            .map_err(|_| Error::Timeout("No HELLO from Discord Gateway".to_string()))?;
        let heartbeat_interval_ms = match hello {
            Some(Ok(WsMessage::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if payload.op != GATEWAY_HELLO {
                    return Err(Error::Transport(format!("Expected HELLO, got op {}", payload.op)));
                }
                payload
                    .d
                    .as_ref()
                    .and_then(|d| d.get("heartbeat_interval"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(41250)
            }
            Some(Ok(WsMessage::Close(frame))) => return Err(close_error(frame.map(|f| u16::from(f.code)))),
            Some(Err(e)) => return Err(Error::Transport(format!("WebSocket error: {}", e))),
            _ => return Err(Error::Transport("Discord Gateway closed before HELLO".to_string())),
        };

        let identify = GatewayIdentify {
            op: GATEWAY_IDENTIFY,
            d: IdentifyData {
                token: &self.config.token,
                intents: INTENTS,
                properties: IdentifyProperties {
                    os: std::env::consts::OS,
                    browser: "switchboard",
                    device: "switchboard",
                },
            },
        };
        write
            .send(WsMessage::Text(serde_json::to_string(&identify)?))
            .await
            .map_err(|e| Error::Transport(format!("Failed to send identify: {}", e)))?;

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        let mut sequence = None;
        loop {
            let msg = tokio::time::timeout_at(deadline, read.next())
                .await
                .map_err(|_| Error::Timeout("No READY from Discord Gateway".to_string()))?;
            let text = match msg {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Close(frame))) => return Err(close_error(frame.map(|f| u16::from(f.code)))),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::Transport(format!("WebSocket error: {}", e))),
                None => return Err(Error::Transport("Discord Gateway closed before READY".to_string())),
            };
            let payload: GatewayPayload = serde_json::from_str(&text)?;
            if payload.s.is_some() {
                sequence = payload.s;
            }
            match (payload.op, payload.t.as_deref()) {
                (GATEWAY_DISPATCH, Some("READY")) => {
                    if let Some(ready) = payload.d.and_then(|d| serde_json::from_value::<ReadyEvent>(d).ok()) {
                        info!(bot = ready.user.username.as_deref().unwrap_or(""), "Discord gateway ready");
                        *self.self_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(ready.user.id);
                    }
                    break;
                }
                (GATEWAY_INVALID_SESSION, _) => {
                    return Err(Error::Transport("Discord rejected the session during IDENTIFY".to_string()))
                }
                _ => {}
            }
        }

        Ok(GatewaySession {
            write,
            read,
            heartbeat: Duration::from_millis(heartbeat_interval_ms),
            sequence,
        })
    }

    async fn run_session(&self, session: GatewaySession, cancel: &CancellationToken) -> Result<()> {
        let GatewaySession {
            mut write,
            mut read,
            heartbeat: period,
            mut sequence,
        } = session;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let hb = GatewayHeartbeat { op: GATEWAY_HEARTBEAT, d: sequence };
                    write
                        .send(WsMessage::Text(serde_json::to_string(&hb)?))
                        .await
                        .map_err(|e| Error::Transport(format!("Failed to send heartbeat: {}", e)))?;
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(frame))) => {
                            return Err(close_error(frame.map(|f| u16::from(f.code))));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(Error::Transport(format!("WebSocket error: {}", e))),
                        None => return Err(Error::Transport("Discord WebSocket stream ended".to_string())),
                    };
                    let payload: GatewayPayload = match serde_json::from_str(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "Unparseable Discord gateway payload");
                            continue;
                        }
                    };
                    if payload.s.is_some() {
                        sequence = payload.s;
                    }

                    match payload.op {
                        GATEWAY_DISPATCH => {
                            if payload.t.as_deref() == Some("MESSAGE_CREATE") {
                                if let Some(d) = payload.d {
                                    if let Err(e) = self.handle_message_create(d).await {
                                        error!(error = %e, "Failed to handle Discord message");
                                        if matches!(e, Error::Closed(_)) {
                                            return Ok(());
                                        }
                                    }
                                }
                            }
                        }
                        GATEWAY_HEARTBEAT => {
                            let hb = GatewayHeartbeat { op: GATEWAY_HEARTBEAT, d: sequence };
                            write
                                .send(WsMessage::Text(serde_json::to_string(&hb)?))
                                .await
                                .map_err(|e| Error::Transport(format!("Failed to send heartbeat: {}", e)))?;
                        }
                        GATEWAY_RECONNECT | GATEWAY_INVALID_SESSION => return Ok(()),
                        GATEWAY_HEARTBEAT_ACK => debug!("Heartbeat ACK received"),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_message_create(&self, data: serde_json::Value) -> Result<()> {
        let msg: DiscordMessage = serde_json::from_value(data)?;

        if msg.author.bot.unwrap_or(false) {
            return Ok(());
        }
        let is_self = self
            .self_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .is_some_and(|id| id == msg.author.id);
        if is_self {
            return Ok(());
        }
        if !self.base.allow_list().allows(&msg.author.id) {
            info!(channel = "discord", sender = %msg.author.id, "Sender not in allow list, dropping message");
            return Ok(());
        }

        let mut attachments = Vec::new();
        for att in &msg.attachments {
            match self.download(&att.url).await {
                Ok(data) => attachments.push(Attachment::new(
                    att.content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    att.filename.clone(),
                    data,
                )),
                Err(e) => error!(error = %e, file = %att.filename, "Failed to download Discord attachment"),
            }
        }

        let chat_type = if msg.guild_id.is_some() {
            ChatType::Group
        } else {
            ChatType::Direct
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("message_id".to_string(), msg.id.clone());
        if let Some(ts) = msg
            .timestamp
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        {
            metadata.insert("timestamp".to_string(), ts.timestamp().to_string());
        }
        if let Some(name) = &msg.author.username {
            metadata.insert("user_name".to_string(), name.clone());
        }
        if let Some(guild) = &msg.guild_id {
            metadata.insert("guild_id".to_string(), guild.clone());
        }

        self.base
            .handle_message(&msg.author.id, &msg.channel_id, &msg.content, attachments, metadata, chat_type)
            .await?;
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to download attachment: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!("Attachment download failed: {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read attachment: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn post_message(&self, chat_id: &str, content: &str, reply_to: Option<&str>) -> Result<()> {
        let request = CreateMessage {
            content,
            message_reference: reply_to.map(|id| MessageReference { message_id: id }),
        };
        let response = self
            .client
            .post(self.api_url(&format!("/channels/{}/messages", chat_id)))
            .header("Authorization", self.auth_header())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to send Discord message: {}", e)))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, &body)
    }

    async fn post_file(&self, chat_id: &str, attachment: &Attachment) -> Result<()> {
        let part = Part::bytes(attachment.data.clone())
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.mime)
            .map_err(|e| Error::Validation(format!("Invalid MIME type '{}': {}", attachment.mime, e)))?;
        let form = Form::new().part("files[0]", part);

        let response = self
            .client
            .post(self.api_url(&format!("/channels/{}/messages", chat_id)))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to upload Discord file: {}", e)))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, &body)
    }
}

fn close_error(code: Option<u16>) -> Error {
    match code {
        Some(CLOSE_AUTHENTICATION_FAILED) => Error::Auth("Discord gateway: authentication failed".to_string()),
        Some(code) => Error::Transport(format!("Discord gateway closed with code {}", code)),
        None => Error::Transport("Discord gateway closed".to_string()),
    }
}

#[async_trait]
impl Channel for DiscordChannel {
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
            return Err(Error::Config("Discord bot token not configured".to_string()));
        }

        self.base.set_state(ChannelState::Starting);
        let session = match self.connect().await {
            Ok(session) => session,
            Err(e) => {
                let state = if matches!(e, Error::Auth(_)) {
                    ChannelState::LoggedOut
                } else {
                    ChannelState::Failed
                };
                self.base.set_state(state);
                return Err(e);
            }
        };

        let run = self.base.begin(&cancel);
        self.base.set_state(ChannelState::Running);
        let this = Arc::clone(&self);
        self.base.spawn(this.run_loop(session, run));
        info!("Discord channel started");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        if !msg.content.is_empty() {
            let chunks = split_message(&msg.content, MAX_MESSAGE_CHARS);
            for (i, chunk) in chunks.iter().enumerate() {
                let reply_to = if i == 0 { msg.reply_to_message_id.as_deref() } else { None };
                self.post_message(&msg.chat_id, chunk, reply_to).await?;
                // Small delay between chunks to avoid rate limiting
                if i + 1 < chunks.len() {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        for attachment in &msg.attachments {
            self.post_file(&msg.chat_id, attachment).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, Recorder};
    use axum::extract::{Path, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[derive(Clone)]
    struct FakeRest {
        ws_url: String,
        sent: Recorder,
    }

    fn rest(ws_url: &str, sent: Recorder) -> Router {
        Router::new()
            .route(
                "/gateway/bot",
                get(|State(s): State<FakeRest>, headers: axum::http::HeaderMap| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bot good") {
                        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "401: Unauthorized"})));
                    }
                    (StatusCode::OK, Json(json!({"url": s.ws_url})))
                }),
            )
            .route(
                "/channels/:id/messages",
                post(|State(s): State<FakeRest>, Path(id): Path<String>, Json(mut body): Json<Value>| async move {
                    body["channel"] = json!(id);
                    s.sent.push(body);
                    Json(json!({"id": "m1"}))
                }),
            )
            .with_state(FakeRest { ws_url: ws_url.to_string(), sent })
    }

    fn dispatch(t: &str, s: u64, d: Value) -> WsMessage {
        WsMessage::Text(json!({"op": 0, "t": t, "s": s, "d": d}).to_string())
    }

    /// Gateway that says hello, checks IDENTIFY and then delivers `events`.
    async fn fake_gateway(events: Vec<WsMessage>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(json!({"op": 10, "d": {"heartbeat_interval": 45000}}).to_string()))
                .await
                .unwrap();
            if let Some(Ok(WsMessage::Text(identify))) = ws.next().await {
                let v: Value = serde_json::from_str(&identify).unwrap();
                assert_eq!(v["op"], 2);
                assert_eq!(v["d"]["intents"], INTENTS);
            }
            for event in events {
                ws.send(event).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });
        format!("ws://{}", addr)
    }

    fn channel(api: &str, token: &str, allow: &[&str], bus: MessageBus) -> Arc<DiscordChannel> {
        let config = DiscordConfig {
            enabled: true,
            token: token.to_string(),
            allow_from: Default::default(),
            api_base: api.to_string(),
        };
        Arc::new(DiscordChannel::new(config, AllowList::new(allow.iter().copied()), bus).unwrap())
    }

    #[tokio::test]
    async fn test_gateway_messages_are_filtered_and_published() {
        let ws_url = fake_gateway(vec![
            dispatch("READY", 1, json!({"user": {"id": "bot1", "username": "sb"}})),
            dispatch("MESSAGE_CREATE", 2, json!({
                "id": "10", "content": "echo", "channel_id": "c1",
                "author": {"id": "bot1", "username": "sb"}
            })),
            dispatch("MESSAGE_CREATE", 3, json!({
                "id": "11", "content": "from other bot", "channel_id": "c1",
                "author": {"id": "b2", "bot": true}
            })),
            dispatch("MESSAGE_CREATE", 4, json!({
                "id": "12", "content": "stranger", "channel_id": "c1",
                "author": {"id": "7"}
            })),
            dispatch("MESSAGE_CREATE", 5, json!({
                "id": "13", "content": "hello", "channel_id": "c9", "guild_id": "g1",
                "author": {"id": "42", "username": "alice"}
            })),
        ])
        .await;
        let api = serve(rest(&ws_url, Recorder::default())).await;

        let bus = MessageBus::new(8);
        let mut inbound = bus.subscribe_inbound().unwrap();
        let ch = channel(&api, "good", &["42"], bus);
        ch.clone().start(CancellationToken::new()).await.unwrap();
        // READY was seen before start returned.
        assert!(ch.running());
        assert_eq!(ch.self_id.lock().unwrap().as_deref(), Some("bot1"));

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender_id, "42");
        assert_eq!(msg.chat_id, "c9");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.chat_type, ChatType::Group);
        assert_eq!(msg.message_id(), Some("13"));
        assert_eq!(msg.session_key(), "discord:c9");

        ch.stop().await.unwrap();
        assert!(!ch.running());
        assert!(inbound.try_recv().is_err());
    }

    fn close_4004() -> WsMessage {
        WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed.".into(),
        }))
    }

    #[tokio::test]
    async fn test_close_4004_during_identify_fails_start() {
        let ws_url = fake_gateway(vec![close_4004()]).await;
        let api = serve(rest(&ws_url, Recorder::default())).await;
        let ch = channel(&api, "good", &[], MessageBus::new(1));

        let err = ch.clone().start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(ch.state(), ChannelState::LoggedOut);
        assert!(!ch.running());
    }

    #[tokio::test]
    async fn test_close_4004_after_ready_logs_out() {
        let ws_url = fake_gateway(vec![
            dispatch("READY", 1, json!({"user": {"id": "bot1", "username": "sb"}})),
            close_4004(),
        ])
        .await;
        let api = serve(rest(&ws_url, Recorder::default())).await;
        let ch = channel(&api, "good", &[], MessageBus::new(1));
        ch.clone().start(CancellationToken::new()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ch.state() != ChannelState::LoggedOut && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ch.state(), ChannelState::LoggedOut);
        assert!(!ch.running());
    }

    #[tokio::test]
    async fn test_bad_token_fails_start() {
        let api = serve(rest("ws://127.0.0.1:9", Recorder::default())).await;
        let ch = channel(&api, "bad", &[], MessageBus::new(1));
        let err = ch.clone().start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(ch.state(), ChannelState::LoggedOut);
    }

    #[tokio::test]
    async fn test_send_replies_and_splits() {
        let sent = Recorder::default();
        let api = serve(rest("ws://unused", sent.clone())).await;
        let ch = channel(&api, "good", &[], MessageBus::new(1));

        let mut msg = OutboundMessage::new("discord", "c9", &"y".repeat(2500));
        msg.reply_to_message_id = Some("13".into());
        ch.send(&msg).await.unwrap();

        let sent = sent.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["channel"], "c9");
        assert_eq!(sent[0]["message_reference"]["message_id"], "13");
        assert!(sent[1].get("message_reference").is_none());
        assert_eq!(sent[0]["content"].as_str().unwrap().len(), 2000);
    }

    #[test]
    fn test_close_error_classification() {
        assert!(matches!(close_error(Some(4004)), Error::Auth(_)));
        assert!(close_error(Some(1006)).is_transient());
        assert!(close_error(None).is_transient());
    }
}
