use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use switchboard_agent::MessageBus;
use switchboard_core::{Attachment, ChatType, InboundMessage, Result};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::util::truncate_for_log;
use crate::ChannelState;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Sender ids permitted on one channel. Empty permits everyone.
///
/// Cloning shares the underlying set, so edits made through the admin API
/// are seen by the adapter on its next inbound message.
#[derive(Clone, Default)]
pub struct AllowList {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl AllowList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(RwLock::new(ids.into_iter().map(Into::into).collect())),
        }
    }

    /// Exact match, or a match on either side of an `id|username` entry, or
    /// on the user part of a `user@server` JID.
    pub fn allows(&self, sender: &str) -> bool {
        let set = match self.inner.read() {
            Ok(set) => set,
            Err(e) => e.into_inner(),
        };
        if set.is_empty() || set.contains(sender) {
            return true;
        }
        let user_part = sender.split('@').next().unwrap_or(sender);
        set.iter().any(|allowed| {
            allowed == user_part || (allowed.contains('|') && allowed.split('|').any(|p| p == sender || p == user_part))
        })
    }

    /// Whether any of one sender's identities (id, username) is listed.
    pub fn allows_any<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> bool {
        ids.into_iter().any(|id| self.allows(id))
    }

    pub fn replace<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut set) = self.inner.write() {
            *set = ids.into_iter().map(Into::into).collect();
        }
    }

    pub fn add(&self, id: &str) {
        if let Ok(mut set) = self.inner.write() {
            set.insert(id.to_string());
        }
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut set) = self.inner.write() {
            set.remove(id);
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// State and behaviour shared by every adapter.
pub struct BaseChannel {
    name: String,
    allow_list: AllowList,
    bus: MessageBus,
    running: AtomicBool,
    state: StdMutex<ChannelState>,
    lifecycle: Mutex<()>,
    cancel: StdMutex<Option<CancellationToken>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl BaseChannel {
    pub fn new(name: &str, allow_list: AllowList, bus: MessageBus) -> Self {
        Self {
            name: name.to_string(),
            allow_list,
            bus,
            running: AtomicBool::new(false),
            state: StdMutex::new(ChannelState::Stopped),
            lifecycle: Mutex::new(()),
            cancel: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: ChannelState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!(channel = %self.name, from = current.as_str(), to = state.as_str(), "Channel state change");
            *current = state;
        }
        self.running.store(state == ChannelState::Running, Ordering::SeqCst);
    }

    /// Serializes `start` and `stop` on one adapter.
    pub async fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Child token for a new run of the adapter; cancelled by `shutdown` or
    /// by the parent.
    pub fn begin(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Spawns a background task owned by this adapter.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Cancels the current run and waits up to the grace period for its
    /// tasks, aborting stragglers.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle().await;
        self.shutdown_locked().await;
    }

    /// `shutdown` for callers already holding the lifecycle lock.
    pub async fn shutdown_locked(&self) {
        if let Some(token) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for mut task in tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!(channel = %self.name, "Channel task did not stop in time, aborting");
                task.abort();
            }
        }
        if self.state() != ChannelState::LoggedOut {
            self.set_state(ChannelState::Stopped);
        }
        self.running.store(false, Ordering::SeqCst);
        info!(channel = %self.name, "Channel stopped");
    }

    /// Filters and publishes one inbound message. Returns whether it was
    /// published.
    pub async fn handle_message(
        &self,
        sender_id: &str,
        chat_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        metadata: BTreeMap<String, String>,
        chat_type: ChatType,
    ) -> Result<bool> {
        self.handle_message_with_aliases(sender_id, &[], chat_id, content, attachments, metadata, chat_type)
            .await
    }

    /// `handle_message` for platforms where a sender may be listed under an
    /// alias (a username). The message keeps `sender_id` either way.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_message_with_aliases(
        &self,
        sender_id: &str,
        aliases: &[&str],
        chat_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        mut metadata: BTreeMap<String, String>,
        chat_type: ChatType,
    ) -> Result<bool> {
        let admitted = self
            .allow_list
            .allows_any(std::iter::once(sender_id).chain(aliases.iter().copied()));
        if !admitted {
            info!(channel = %self.name, sender = %sender_id, "Sender not in allow list, dropping message");
            return Ok(false);
        }
        if content.is_empty() && attachments.is_empty() {
            debug!(channel = %self.name, sender = %sender_id, "Empty message, dropping");
            return Ok(false);
        }

        metadata
            .entry("message_id".to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string());
        metadata
            .entry("timestamp".to_string())
            .or_insert_with(|| chrono::Utc::now().timestamp().to_string());
        if chat_type == ChatType::Group {
            metadata.entry("sender_id".to_string()).or_insert_with(|| sender_id.to_string());
        }

        info!(
            channel = %self.name,
            sender = %sender_id,
            chat = %chat_id,
            attachments = attachments.len(),
            content = %truncate_for_log(content, 80),
            "Inbound message"
        );

        let mut msg = InboundMessage::new(&self.name, sender_id, chat_id, content).with_chat_type(chat_type);
        msg.attachments = attachments;
        msg.metadata = metadata;
        self.bus.publish_inbound(msg).await?;
        Ok(true)
    }
}
