use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchboard_agent::MessageBus;
use switchboard_core::config::ChannelsConfig;
use switchboard_core::{Config, Error, OutboundMessage, Result, Workspace};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::base::AllowList;
use crate::{Channel, ChannelState};

/// Snapshot of one channel for `status` and the admin UI.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub state: ChannelState,
    pub detail: String,
}

/// Owns the enabled adapters and the allow-lists of every known channel.
pub struct ChannelManager {
    channels: BTreeMap<String, Arc<dyn Channel>>,
    allow_lists: BTreeMap<String, AllowList>,
    details: BTreeMap<String, String>,
    bus: MessageBus,
    start_backoff: Backoff,
}

impl ChannelManager {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            channels: BTreeMap::new(),
            allow_lists: BTreeMap::new(),
            details: BTreeMap::new(),
            bus,
            start_backoff: Backoff::default(),
        }
    }

    /// Builds an adapter for every enabled channel. Disabled channels still
    /// get an allow-list so the admin API can edit it.
    pub fn from_config(config: &Config, workspace: &Workspace, bus: MessageBus) -> Result<Self> {
        let mut manager = Self::new(bus);
        let channels = &config.channels;

        for name in ChannelsConfig::NAMES {
            let ids: Vec<String> = channels
                .allow_from(name)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default();
            manager.allow_lists.insert(name.to_string(), AllowList::new(ids));
            manager.details.insert(name.to_string(), config_detail(channels, name));
        }

        #[cfg(feature = "telegram")]
        if channels.telegram.enabled {
            let ch = crate::telegram::TelegramChannel::new(
                channels.telegram.clone(),
                manager.allow_list_for("telegram"),
                manager.bus.clone(),
            )?;
            manager.register(Arc::new(ch));
        }

        #[cfg(feature = "discord")]
        if channels.discord.enabled {
            let ch = crate::discord::DiscordChannel::new(
                channels.discord.clone(),
                manager.allow_list_for("discord"),
                manager.bus.clone(),
            )?;
            manager.register(Arc::new(ch));
        }

        #[cfg(feature = "whatsapp")]
        if channels.whatsapp.enabled {
            let ch = crate::whatsapp::WhatsAppChannel::new(
                channels.whatsapp.clone(),
                workspace.clone(),
                manager.allow_list_for("whatsapp"),
                manager.bus.clone(),
            )?;
            manager.register(Arc::new(ch));
        }
        #[cfg(not(feature = "whatsapp"))]
        let _ = workspace;

        #[cfg(feature = "feishu")]
        if channels.feishu.enabled {
            let ch = crate::feishu::FeishuChannel::new(
                channels.feishu.clone(),
                manager.allow_list_for("feishu"),
                manager.bus.clone(),
            )?;
            manager.register(Arc::new(ch));
        }

        #[cfg(feature = "slack")]
        if channels.slack.enabled {
            let ch = crate::slack::SlackChannel::new(
                channels.slack.clone(),
                manager.allow_list_for("slack"),
                manager.bus.clone(),
            )?;
            manager.register(Arc::new(ch));
        }

        info!(enabled = ?manager.names(), "Channels configured");
        Ok(manager)
    }

    fn allow_list_for(&mut self, name: &str) -> AllowList {
        self.allow_lists.entry(name.to_string()).or_default().clone()
    }

    /// Adds an adapter, adopting its allow-list.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        self.allow_lists
            .insert(name.clone(), channel.base().allow_list().clone());
        self.details.entry(name.clone()).or_insert_with(|| "registered".to_string());
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn allow_list(&self, name: &str) -> Option<AllowList> {
        self.allow_lists.get(name).cloned()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Backoff used between start attempts that failed transiently.
    pub fn set_start_backoff(&mut self, backoff: Backoff) {
        self.start_backoff = backoff;
    }

    /// Starts one adapter, retrying transient failures until it comes up.
    /// Auth and config errors are final. `abort` interrupts a pending start,
    /// including a pairing wait; `run` is handed to the adapter for its
    /// event loop.
    pub async fn start_channel(
        channel: Arc<dyn Channel>,
        run: CancellationToken,
        abort: CancellationToken,
        mut backoff: Backoff,
    ) -> Result<()> {
        let name = channel.name().to_string();
        let cancelled = || Error::Cancelled(format!("start of channel '{}'", name));
        loop {
            let result = tokio::select! {
                r = Arc::clone(&channel).start(run.clone()) => r,
                _ = abort.cancelled() => return Err(cancelled()),
            };
            match result {
                Ok(()) => {
                    info!(channel = %name, attempts = backoff.attempt() + 1, "Channel started");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(channel = %name, error = %e, attempt = backoff.attempt(), "Channel start failed, retrying");
                    channel.base().set_state(ChannelState::Reconnecting);
                    if !backoff.wait(&abort).await {
                        return Err(cancelled());
                    }
                }
                Err(e) => {
                    error!(channel = %name, error = %e, "Channel failed to start");
                    return Err(e);
                }
            }
        }
    }

    /// Spawns the outbound dispatchers and one start task per adapter, then
    /// returns without waiting. An adapter stuck pairing or retrying never
    /// holds up the others.
    pub fn spawn_all(&self, run: &CancellationToken, abort: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = self.spawn_outbound_dispatchers(run)?;
        for channel in self.channels.values() {
            let channel = Arc::clone(channel);
            let run = run.clone();
            let abort = abort.clone();
            let backoff = self.start_backoff.clone();
            handles.push(tokio::spawn(async move {
                if let Err(Error::Cancelled(what)) = Self::start_channel(channel, run, abort, backoff).await {
                    debug!(what = %what, "Channel start abandoned");
                }
            }));
        }
        Ok(handles)
    }

    pub async fn stop_all(&self) {
        let stops = self.channels.iter().map(|(name, ch)| async move {
            if let Err(e) = ch.stop().await {
                warn!(channel = %name, error = %e, "Channel stop failed");
            }
        });
        join_all(stops).await;
    }

    /// Sends one outbound message through its channel.
    pub async fn dispatch_outbound_msg(&self, msg: &OutboundMessage) -> Result<()> {
        let channel = self
            .channels
            .get(&msg.channel_id)
            .ok_or_else(|| Error::NotFound(format!("channel '{}'", msg.channel_id)))?;
        channel.send(msg).await
    }

    /// One outbound consumer per adapter, so a slow platform only delays its
    /// own replies.
    pub fn spawn_outbound_dispatchers(&self, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.channels.len());
        for (name, channel) in &self.channels {
            let mut rx = self.bus.subscribe_outbound(name)?;
            let channel = Arc::clone(channel);
            let cancel = cancel.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                debug!(channel = %name, "Outbound dispatcher started");
                loop {
                    // Queued replies go out before a cancel is honoured.
                    let msg = tokio::select! {
                        biased;
                        m = rx.recv() => match m {
                            Some(m) => m,
                            None => break,
                        },
                        _ = cancel.cancelled() => break,
                    };
                    if let Err(e) = channel.send(&msg).await {
                        error!(channel = %name, chat = %msg.chat_id, error = %e, "Failed to dispatch outbound message");
                    }
                }
                debug!(channel = %name, "Outbound dispatcher stopped");
            }));
        }
        Ok(handles)
    }

    pub fn status(&self) -> Vec<ChannelStatus> {
        let mut names: Vec<&String> = self.details.keys().collect();
        for name in self.channels.keys() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
            .into_iter()
            .map(|name| {
                let ch = self.channels.get(name);
                ChannelStatus {
                    name: name.clone(),
                    enabled: ch.is_some(),
                    running: ch.is_some_and(|c| c.running()),
                    state: ch.map(|c| c.state()).unwrap_or(ChannelState::Stopped),
                    detail: self.details.get(name).cloned().unwrap_or_default(),
                }
            })
            .collect()
    }
}

/// Human-readable configuration summary for one channel.
pub fn config_detail(channels: &ChannelsConfig, name: &str) -> String {
    let configured = |ok: bool, missing: &str| {
        if ok {
            "configured".to_string()
        } else {
            format!("{} not set", missing)
        }
    };
    match name {
        "telegram" => configured(!channels.telegram.token.is_empty(), "token"),
        "discord" => configured(!channels.discord.token.is_empty(), "token"),
        "whatsapp" => format!("bridge: {}", channels.whatsapp.bridge_url),
        "feishu" => configured(!channels.feishu.app_id.is_empty(), "appId"),
        "slack" => configured(!channels.slack.bot_token.is_empty(), "botToken"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseChannel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum StartMode {
        Ok,
        Revoked,
        /// Fails transiently this many times, then comes up.
        Flaky(usize),
        /// Never returns, like an adapter waiting for a QR scan.
        Pending,
    }

    struct MockChannel {
        base: BaseChannel,
        mode: StartMode,
        starts: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl MockChannel {
        fn new(name: &str, mode: StartMode, bus: MessageBus) -> Arc<Self> {
            Arc::new(Self {
                base: BaseChannel::new(name, AllowList::default(), bus),
                mode,
                starts: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn base(&self) -> &BaseChannel {
            &self.base
        }

        async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                StartMode::Revoked => {
                    self.base.set_state(ChannelState::LoggedOut);
                    return Err(Error::Auth("revoked".into()));
                }
                StartMode::Flaky(failures) if n < failures => {
                    self.base.set_state(ChannelState::Failed);
                    return Err(Error::Transport("connection refused".into()));
                }
                StartMode::Pending => {
                    self.base.set_state(ChannelState::Pairing);
                    std::future::pending::<()>().await;
                }
                _ => {}
            }
            self.base.begin(&cancel);
            self.base.set_state(ChannelState::Running);
            Ok(())
        }

        async fn send(&self, msg: &OutboundMessage) -> Result<()> {
            self.sent.lock().unwrap().push(msg.content.clone());
            Ok(())
        }
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(10), Duration::from_millis(50))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_failed_start_does_not_block_others() {
        let bus = MessageBus::new(8);
        let mut manager = ChannelManager::new(bus.clone());
        manager.set_start_backoff(fast_backoff());
        let good = MockChannel::new("telegram", StartMode::Ok, bus.clone());
        let revoked = MockChannel::new("whatsapp", StartMode::Revoked, bus.clone());
        manager.register(good.clone());
        manager.register(revoked.clone());

        let run = CancellationToken::new();
        let abort = CancellationToken::new();
        let handles = manager.spawn_all(&run, &abort).unwrap();
        wait_until(|| good.running() && revoked.starts.load(Ordering::SeqCst) == 1).await;

        let status = manager.status();
        let wa = status.iter().find(|s| s.name == "whatsapp").unwrap();
        assert_eq!(wa.state, ChannelState::LoggedOut);
        assert!(!wa.running);
        assert!(status.iter().find(|s| s.name == "telegram").unwrap().running);

        // Auth failures are final, not retried.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(revoked.starts.load(Ordering::SeqCst), 1);

        run.cancel();
        abort.cancel();
        for h in handles {
            h.await.unwrap();
        }
        manager.stop_all().await;
        assert!(!good.running());
    }

    #[tokio::test]
    async fn test_transient_start_failure_is_retried() {
        let bus = MessageBus::new(8);
        let flaky = MockChannel::new("discord", StartMode::Flaky(2), bus);
        let result = ChannelManager::start_channel(
            flaky.clone(),
            CancellationToken::new(),
            CancellationToken::new(),
            fast_backoff(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(flaky.starts.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.state(), ChannelState::Running);
    }

    #[tokio::test]
    async fn test_pending_start_does_not_stall_others_and_can_be_aborted() {
        let bus = MessageBus::new(8);
        let mut manager = ChannelManager::new(bus.clone());
        let good = MockChannel::new("telegram", StartMode::Ok, bus.clone());
        let pairing = MockChannel::new("whatsapp", StartMode::Pending, bus.clone());
        manager.register(good.clone());
        manager.register(pairing.clone());

        let run = CancellationToken::new();
        let abort = CancellationToken::new();
        let handles = manager.spawn_all(&run, &abort).unwrap();
        wait_until(|| good.running()).await;
        assert_eq!(pairing.state(), ChannelState::Pairing);

        bus.publish_outbound(OutboundMessage::new("telegram", "1", "still flowing"))
            .await
            .unwrap();
        wait_until(|| !good.sent.lock().unwrap().is_empty()).await;

        abort.cancel();
        run.cancel();
        tokio::time::timeout(Duration::from_secs(2), async {
            for h in handles {
                h.await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(!pairing.running());
    }

    #[tokio::test]
    async fn test_outbound_dispatch_routes_by_channel() {
        let bus = MessageBus::new(8);
        let mut manager = ChannelManager::new(bus.clone());
        let tg = MockChannel::new("telegram", StartMode::Ok, bus.clone());
        let dc = MockChannel::new("discord", StartMode::Ok, bus.clone());
        manager.register(tg.clone());
        manager.register(dc.clone());

        let cancel = CancellationToken::new();
        let handles = manager.spawn_outbound_dispatchers(&cancel).unwrap();
        bus.publish_outbound(OutboundMessage::new("discord", "c1", "to discord")).await.unwrap();
        bus.publish_outbound(OutboundMessage::new("telegram", "1", "to telegram")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (tg.sent.lock().unwrap().is_empty() || dc.sent.lock().unwrap().is_empty())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*tg.sent.lock().unwrap(), vec!["to telegram".to_string()]);
        assert_eq!(*dc.sent.lock().unwrap(), vec!["to discord".to_string()]);

        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
        assert!(matches!(
            manager
                .dispatch_outbound_msg(&OutboundMessage::new("slack", "x", "y"))
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_from_config_builds_enabled_channels_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.channels.telegram.enabled = true;
        config.channels.telegram.token = "T".into();
        config.channels.slack.allow_from.push("U42".into());

        let manager = ChannelManager::from_config(&config, &Workspace::new(dir.path()), MessageBus::new(1)).unwrap();
        assert_eq!(manager.names(), vec!["telegram".to_string()]);
        assert_eq!(manager.allow_list("slack").unwrap().snapshot(), vec!["U42".to_string()]);

        let status = manager.status();
        assert_eq!(status.len(), 5);
        let slack = status.iter().find(|s| s.name == "slack").unwrap();
        assert!(!slack.enabled);
        assert_eq!(slack.detail, "botToken not set");
    }
}
