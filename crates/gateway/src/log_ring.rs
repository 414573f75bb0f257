use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub message: String,
}

/// Bounded in-memory log buffer for the admin UI. The oldest entry is
/// discarded once `capacity` is reached; every push is also broadcast to
/// live subscribers.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<RingInner>,
}

struct RingInner {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    tx: broadcast::Sender<LogEntry>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Arc::new(RingInner {
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                tx,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.inner.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        // Sent under the lock so `subscribe` never sees an entry twice.
        let _ = self.inner.tx.send(entry);
    }

    pub fn record(&self, level: &str, component: &str, message: &str) {
        self.push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            component: component.to_string(),
            message: message.to_string(),
        });
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current contents plus a receiver for everything pushed afterwards.
    pub fn subscribe(&self) -> (Vec<LogEntry>, broadcast::Receiver<LogEntry>) {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.inner.tx.subscribe();
        (entries.iter().cloned().collect(), rx)
    }
}

/// `tracing` layer that copies every event into a [`LogRing`]. The event
/// target becomes the entry's component.
pub struct LogRingLayer {
    ring: LogRing,
}

impl LogRingLayer {
    pub fn new(ring: LogRing) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut message = visitor.message;
        message.push_str(&visitor.fields);
        self.ring.push(LogEntry {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            component: meta.target().to_string(),
            message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
