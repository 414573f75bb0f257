use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use switchboard_agent::MessageBus;
use switchboard_core::config::WhatsAppConfig;
use switchboard_core::{ChatType, Error, OutboundMessage, Result, Workspace};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::base::{AllowList, BaseChannel};
use crate::util::DedupSet;
use crate::whatsapp_store::{DeviceRecord, DeviceStore};
use crate::{Channel, ChannelState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;

const DEDUP_CAPACITY: usize = 1000;

/// Commands sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Pair,
    Resume {
        jid: &'a str,
        credentials: &'a serde_json::Value,
    },
    Send {
        to: &'a str,
        text: &'a str,
    },
    SendMedia {
        to: &'a str,
        mime: &'a str,
        filename: &'a str,
        data: String,
    },
}

/// Events emitted by the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        code: String,
    },
    Paired {
        jid: String,
        #[serde(default)]
        push_name: Option<String>,
        #[serde(default)]
        credentials: serde_json::Value,
    },
    Connected {
        #[serde(default)]
        jid: Option<String>,
    },
    Message(WaMessage),
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    LoggedOut {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WaMessage {
    id: String,
    /// Sender JID.
    from: String,
    /// Chat JID; a group JID for group messages.
    chat: String,
    #[serde(default)]
    from_me: bool,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    push_name: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    extended_text: Option<ExtendedText>,
}

#[derive(Debug, Deserialize)]
struct ExtendedText {
    #[serde(default)]
    text: Option<String>,
}

impl WaMessage {
    fn text(&self) -> &str {
        self.conversation
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.extended_text.as_ref().and_then(|e| e.text.as_deref()))
            .unwrap_or("")
    }
}

enum Flow {
    Continue,
    Ready,
}

/// WhatsApp channel talking to a bridge process that owns the Signal
/// session, with the paired device persisted in the workspace.
pub struct WhatsAppChannel {
    base: BaseChannel,
    config: WhatsAppConfig,
    workspace: Workspace,
    store: DeviceStore,
    sink: Mutex<Option<WsSink>>,
    seen: StdMutex<DedupSet>,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig, workspace: Workspace, allow_list: AllowList, bus: MessageBus) -> Result<Self> {
        let store = DeviceStore::open(&workspace.whatsapp_db())?;
        Ok(Self {
            base: BaseChannel::new("whatsapp", allow_list, bus),
            config,
            workspace,
            store,
            sink: Mutex::new(None),
            seen: StdMutex::new(DedupSet::new(DEDUP_CAPACITY)),
        })
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    async fn send_command(&self, cmd: &BridgeCommand<'_>) -> Result<()> {
        let json = serde_json::to_string(cmd)?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("WhatsApp bridge not connected".to_string()))?;
        sink.send(WsMessage::Text(json))
            .await
            .map_err(|e| Error::Transport(format!("Failed to write to WhatsApp bridge: {}", e)))
    }

    /// Connects to the bridge and drives it until the device is paired or
    /// the stored session is live.
    async fn handshake(&self, cancel: &CancellationToken) -> Result<WsRead> {
        let url = url::Url::parse(&self.config.bridge_url)
            .map_err(|e| Error::Config(format!("Invalid bridge URL: {}", e)))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("WhatsApp bridge connection failed: {}", e)))?;
        debug!(url = %self.config.bridge_url, "Connected to WhatsApp bridge");

        let (write, mut read) = ws_stream.split();
        *self.sink.lock().await = Some(write);

        match self.store.load()? {
            Some(device) => {
                info!(jid = %device.jid, "Resuming stored WhatsApp session");
                self.send_command(&BridgeCommand::Resume {
                    jid: &device.jid,
                    credentials: &device.credentials,
                })
                .await?;
            }
            None => {
                info!("No stored WhatsApp device, requesting pairing");
                self.send_command(&BridgeCommand::Pair).await?;
            }
        }

        loop {
            let frame = tokio::select! {
                f = read.next() => f,
                _ = cancel.cancelled() => {
                    self.close_sink().await;
                    return Err(Error::Cancelled("WhatsApp start cancelled".to_string()));
                }
            };
            let text = self.frame_text(frame).await?;
            if let Some(text) = text {
                if let Flow::Ready = self.handle_event(&text).await? {
                    return Ok(read);
                }
            }
        }
    }

    /// Text payload of one frame; `None` for control frames.
    async fn frame_text(
        &self,
        frame: Option<std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) -> Result<Option<String>> {
        match frame {
            Some(Ok(WsMessage::Text(text))) => Ok(Some(text)),
            Some(Ok(WsMessage::Close(_))) | None => {
                self.close_sink().await;
                Err(Error::Transport("WhatsApp bridge closed connection".to_string()))
            }
            Some(Ok(WsMessage::Ping(data))) => {
                if let Some(sink) = self.sink.lock().await.as_mut() {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(_)) => Ok(None),
            Some(Err(e)) => {
                self.close_sink().await;
                Err(Error::Transport(format!("WhatsApp bridge error: {}", e)))
            }
        }
    }

    async fn close_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    async fn handle_event(&self, text: &str) -> Result<Flow> {
        let raw: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unparseable WhatsApp bridge frame");
                return Ok(Flow::Continue);
            }
        };
        let event: BridgeEvent = match serde_json::from_value(raw.clone()) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "Malformed WhatsApp bridge event");
                return Ok(Flow::Continue);
            }
        };

        match event {
            BridgeEvent::Qr { code } => {
                self.base.set_state(ChannelState::Pairing);
                self.write_qr(&code)?;
                info!(
                    path = %self.workspace.whatsapp_qr_ascii().display(),
                    "Scan the WhatsApp QR code to pair this device"
                );
                Ok(Flow::Continue)
            }
            BridgeEvent::Paired { jid, push_name, credentials } => {
                self.store.save(&DeviceRecord {
                    jid: jid.clone(),
                    push_name,
                    credentials,
                })?;
                self.remove_qr();
                info!(jid = %jid, "WhatsApp device paired");
                self.base.set_state(ChannelState::Running);
                Ok(Flow::Ready)
            }
            BridgeEvent::Connected { jid } => {
                info!(jid = jid.as_deref().unwrap_or(""), "WhatsApp connected");
                self.base.set_state(ChannelState::Running);
                Ok(Flow::Ready)
            }
            BridgeEvent::Message(msg) => {
                if let Err(e) = self.handle_message(msg).await {
                    if matches!(e, Error::Closed(_)) {
                        return Err(e);
                    }
                    error!(error = %e, "Failed to handle WhatsApp message");
                }
                Ok(Flow::Continue)
            }
            BridgeEvent::Disconnected { reason } => Err(Error::Transport(format!(
                "WhatsApp disconnected: {}",
                reason.as_deref().unwrap_or("unknown reason")
            ))),
            BridgeEvent::LoggedOut { reason } => {
                warn!(reason = reason.as_deref().unwrap_or(""), "WhatsApp session logged out");
                self.store.clear()?;
                self.remove_qr();
                self.base.set_state(ChannelState::LoggedOut);
                Err(Error::Auth("WhatsApp session logged out".to_string()))
            }
            BridgeEvent::Unknown => {
                debug!(event_type = raw.get("type").and_then(|t| t.as_str()).unwrap_or(""), "Ignoring unknown WhatsApp event");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_message(&self, msg: WaMessage) -> Result<()> {
        if msg.from_me {
            return Ok(());
        }
        if self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check_and_insert(&msg.id)
        {
            debug!(id = %msg.id, "Duplicate WhatsApp message, skipping");
            return Ok(());
        }

        let chat_type = if msg.is_group || msg.chat.ends_with("@g.us") {
            ChatType::Group
        } else {
            ChatType::Direct
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("message_id".to_string(), msg.id.clone());
        if let Some(ts) = msg.timestamp {
            metadata.insert("timestamp".to_string(), ts.to_string());
        }
        if let Some(name) = &msg.push_name {
            metadata.insert("user_name".to_string(), name.clone());
        }

        self.base
            .handle_message(&msg.from, &msg.chat, msg.text(), Vec::new(), metadata, chat_type)
            .await?;
        Ok(())
    }

    fn write_qr(&self, code: &str) -> Result<()> {
        let qr = qrcode::QrCode::new(code.as_bytes())
            .map_err(|e| Error::Validation(format!("Failed to encode QR payload: {}", e)))?;
        let ascii = qr
            .render::<qrcode::render::unicode::Dense1x2>()
            .quiet_zone(true)
            .build();
        std::fs::write(self.workspace.whatsapp_qr_ascii(), &ascii)
            .map_err(|e| Error::Resource(format!("Failed to write QR file: {}", e)))?;
        std::fs::write(self.workspace.whatsapp_qr_code(), code)
            .map_err(|e| Error::Resource(format!("Failed to write QR file: {}", e)))?;
        Ok(())
    }

    fn remove_qr(&self) {
        let _ = std::fs::remove_file(self.workspace.whatsapp_qr_ascii());
        let _ = std::fs::remove_file(self.workspace.whatsapp_qr_code());
    }

    async fn pump(&self, mut read: WsRead, cancel: &CancellationToken) -> Result<()> {
        loop {
            let frame = tokio::select! {
                f = read.next() => f,
                _ = cancel.cancelled() => {
                    self.close_sink().await;
                    return Ok(());
                }
            };
            if let Some(text) = self.frame_text(frame).await? {
                self.handle_event(&text).await?;
            }
        }
    }

    async fn run_loop(self: Arc<Self>, read: WsRead, cancel: CancellationToken) {
        let mut backoff = Backoff::default();
        let mut current = Some(read);

        loop {
            let result = match current.take() {
                Some(read) => self.pump(read, &cancel).await,
                None => match self.handshake(&cancel).await {
                    Ok(read) => {
                        backoff.reset();
                        self.pump(read, &cancel).await
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(()) => break,
                Err(Error::Cancelled(_)) => break,
                Err(Error::Closed(_)) => {
                    debug!("Bus closed, WhatsApp loop exiting");
                    break;
                }
                Err(Error::Auth(msg)) => {
                    error!(error = %msg, "WhatsApp channel logged out");
                    self.base.set_state(ChannelState::LoggedOut);
                    self.close_sink().await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempt(), "WhatsApp bridge connection lost, reconnecting");
                    self.base.set_state(ChannelState::Reconnecting);
                    self.close_sink().await;
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                }
            }
        }
        debug!("WhatsApp event loop exited");
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn base(&self) -> &BaseChannel {
        &self.base
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let _guard = self.base.lifecycle().await;
        if self.base.running() {
            return Ok(());
        }
        if self.config.bridge_url.is_empty() {
            self.base.set_state(ChannelState::Failed);
            return Err(Error::Config("WhatsApp bridge URL not configured".to_string()));
        }

        self.base.set_state(ChannelState::Starting);
        let run = self.base.begin(&cancel);
        let read = match self.handshake(&run).await {
            Ok(read) => read,
            Err(e) => {
                if !matches!(e, Error::Auth(_)) {
                    self.base.set_state(ChannelState::Failed);
                }
                run.cancel();
                return Err(e);
            }
        };

        let this = Arc::clone(&self);
        self.base.spawn(this.run_loop(read, run));
        info!("WhatsApp channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.base.shutdown().await;
        self.close_sink().await;
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        if !msg.content.is_empty() {
            self.send_command(&BridgeCommand::Send {
                to: &msg.chat_id,
                text: &msg.content,
            })
            .await?;
        }
        for attachment in &msg.attachments {
            self.send_command(&BridgeCommand::SendMedia {
                to: &msg.chat_id,
                mime: &attachment.mime,
                filename: &attachment.filename,
                data: B64.encode(&attachment.data),
            })
            .await?;
        }
        Ok(())
    }
}
