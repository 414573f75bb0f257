use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use switchboard_core::{Error, InboundMessage, OutboundMessage, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// In-process message fabric between channels and the agent.
///
/// Inbound is a single bounded queue: publishers wait when it is full. Outbound
/// is demultiplexed into one bounded queue per channel id. Cloning the bus
/// clones a handle to the same queues.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    inbound_tx: RwLock<Option<mpsc::Sender<InboundMessage>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    outbound: RwLock<HashMap<String, mpsc::Sender<OutboundMessage>>>,
    buffer_size: usize,
    closed: CancellationToken,
}

impl MessageBus {
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        Self {
            inner: Arc::new(BusInner {
                inbound_tx: RwLock::new(Some(inbound_tx)),
                inbound_rx: Mutex::new(Some(inbound_rx)),
                outbound: RwLock::new(HashMap::new()),
                buffer_size,
                closed: CancellationToken::new(),
            }),
        }
    }

    fn closed_err() -> Error {
        Error::Closed("message bus is closed".to_string())
    }

    /// Waits for queue space; fails with `Closed` once the bus shuts down.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        let tx = self
            .inner
            .inbound_tx
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(Self::closed_err)?;

        tokio::select! {
            res = tx.send(msg) => res.map_err(|_| Self::closed_err()),
            _ = self.inner.closed.cancelled() => Err(Self::closed_err()),
        }
    }

    /// Hands out the single inbound receiver. The stream ends after `close`.
    pub fn subscribe_inbound(&self) -> Result<mpsc::Receiver<InboundMessage>> {
        self.inner
            .inbound_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| Error::Validation("inbound stream already subscribed".to_string()))
    }

    /// Registers `channel_id` as an outbound destination. A second
    /// subscription for the same id replaces the first.
    pub fn subscribe_outbound(&self, channel_id: &str) -> Result<mpsc::Receiver<OutboundMessage>> {
        if self.is_closed() {
            return Err(Self::closed_err());
        }
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        let mut map = self
            .inner
            .outbound
            .write()
            .map_err(|_| Error::Resource("outbound map poisoned".to_string()))?;
        map.insert(channel_id.to_string(), tx);
        debug!(channel = %channel_id, "Outbound subscriber registered");
        Ok(rx)
    }

    pub fn unsubscribe_outbound(&self, channel_id: &str) {
        if let Ok(mut map) = self.inner.outbound.write() {
            map.remove(channel_id);
        }
    }

    /// Routes to the subscriber for `msg.channel_id`; `NotFound` when no
    /// channel with that id is live.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Self::closed_err());
        }
        let tx = self
            .inner
            .outbound
            .read()
            .ok()
            .and_then(|map| map.get(&msg.channel_id).cloned())
            .ok_or_else(|| Error::NotFound(format!("no live channel '{}'", msg.channel_id)))?;

        let channel_id = msg.channel_id.clone();
        tokio::select! {
            res = tx.send(msg) => res.map_err(|_| Error::NotFound(format!("channel '{}' stopped", channel_id))),
            _ = self.inner.closed.cancelled() => Err(Self::closed_err()),
        }
    }

    /// Drops every sender so subscribers drain what is queued and then see
    /// end-of-stream. Idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
        if let Ok(mut tx) = self.inner.inbound_tx.write() {
            tx.take();
        }
        if let Ok(mut map) = self.inner.outbound.write() {
            map.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}
