use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchboard_agent::{Agent, MessageBus};
use switchboard_channels::ChannelManager;
use switchboard_core::{Config, Error, InboundMessage, Result, Workspace};
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::SharedConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_concurrent_turns: usize,
    pub shutdown_grace: Duration,
    pub session_idle: Duration,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_turns: config.agents.defaults.max_concurrent_turns.max(1),
            shutdown_grace: Duration::from_secs(config.gateway.shutdown_grace_secs),
            session_idle: Duration::from_secs(config.agents.defaults.session_idle_secs.max(1)),
        }
    }
}

/// Adapter tasks belonging to one start of the channel set.
struct AdapterRun {
    /// Handed to the adapters' event loops and outbound dispatchers.
    cancel: CancellationToken,
    /// Child of `shutdown`; interrupts starts that are still pending.
    abort_start: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Completion signal of the latest turn queued on each session key.
///
/// A turn waits for its predecessor on the same key before it starts, so
/// replies for one chat leave in the order the messages arrived.
#[derive(Default)]
struct TurnQueue {
    tails: HashMap<String, oneshot::Receiver<()>>,
}

impl TurnQueue {
    /// Registers a new tail for `key`, returning the previous one to await
    /// and the sender to drop once the new turn is done.
    fn enqueue(&mut self, key: &str) -> (Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        let (done, tail) = oneshot::channel();
        (self.tails.insert(key.to_string(), tail), done)
    }

    /// Forgets keys whose last turn has finished.
    fn prune(&mut self) {
        self.tails
            .retain(|_, tail| matches!(tail.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
    }

    fn len(&self) -> usize {
        self.tails.len()
    }
}

/// Owns the channel adapters and the inbound dispatch loop.
///
/// Every inbound message becomes one agent turn on a worker task; at most
/// `max_concurrent_turns` run at once and the loop stops pulling from the
/// bus while all workers are busy. Turns on the same session run in
/// arrival order.
pub struct Supervisor {
    agent: Arc<Agent>,
    bus: MessageBus,
    config: SharedConfig,
    workspace: Workspace,
    channels: RwLock<Arc<ChannelManager>>,
    settings: SupervisorSettings,
    state: watch::Sender<SupervisorState>,
    shutdown: CancellationToken,
    restart: Notify,
}

impl Supervisor {
    pub fn new(
        agent: Arc<Agent>,
        bus: MessageBus,
        channels: ChannelManager,
        config: SharedConfig,
        workspace: Workspace,
        settings: SupervisorSettings,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            agent,
            bus,
            config,
            workspace,
            channels: RwLock::new(Arc::new(channels)),
            settings,
            state,
            shutdown: CancellationToken::new(),
            restart: Notify::new(),
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The live channel set. Replaced on restart.
    pub fn channels(&self) -> Arc<ChannelManager> {
        let guard = self.channels.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            info!(from = ?prev, to = ?state, "Supervisor state changed");
        }
    }

    /// Stops accepting work and lets `run` drain and return.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drains in-flight turns, then stops and rebuilds the adapters from the
    /// current configuration. Handled by the `run` loop.
    pub fn request_restart(&self) {
        info!("Restart requested");
        self.restart.notify_one();
    }

    /// Launches every adapter on its own task and returns immediately.
    fn start_adapters(&self) -> AdapterRun {
        let manager = self.channels();
        // Not tied to `shutdown`: adapters outlive the drain so replies of
        // in-flight turns still go out.
        let cancel = CancellationToken::new();
        let abort_start = self.shutdown.child_token();
        let tasks = match manager.spawn_all(&cancel, &abort_start) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to start channels");
                Vec::new()
            }
        };
        info!(channels = manager.names().len(), "Channels launching");
        AdapterRun {
            cancel,
            abort_start,
            tasks,
        }
    }

    async fn stop_adapters(&self, run: AdapterRun) {
        let manager = self.channels();
        run.abort_start.cancel();
        run.cancel.cancel();
        for handle in run.tasks {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Channel task did not exit in time");
            }
        }
        manager.stop_all().await;
        for name in manager.names() {
            self.bus.unsubscribe_outbound(&name);
        }
    }

    fn spawn_turn(
        &self,
        workers: &mut JoinSet<()>,
        queue: &mut TurnQueue,
        permit: tokio::sync::OwnedSemaphorePermit,
        msg: InboundMessage,
        cancel: CancellationToken,
    ) {
        let agent = Arc::clone(&self.agent);
        let key = msg.session_key();
        let (previous, done) = queue.enqueue(&key);
        workers.spawn(async move {
            let _permit = permit;
            let _done = done;
            if let Some(previous) = previous {
                // Err only means the previous turn's task is gone.
                let _ = previous.await;
            }
            let channel = msg.channel_id.clone();
            match agent.dispatch(msg, &cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled(_)) => debug!(session = %key, "Turn cancelled"),
                Err(e) => error!(channel = %channel, session = %key, error = %e, "Dispatch failed"),
            }
        });
    }

    /// Waits up to the grace window for in-flight turns, then cancels and
    /// aborts whatever is left.
    async fn drain(&self, workers: &mut JoinSet<()>, turns: &CancellationToken) {
        let in_flight = workers.len();
        if in_flight == 0 {
            return;
        }
        info!(in_flight, grace_secs = self.settings.shutdown_grace.as_secs(), "Draining in-flight turns");
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = workers.len(), "Turns did not finish in the grace window, cancelling");
            turns.cancel();
            if tokio::time::timeout(Duration::from_secs(1), async {
                while workers.join_next().await.is_some() {}
            })
            .await
            .is_err()
            {
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }
        }
    }

    async fn rebuild_channels(&self) {
        let config = {
            let guard = self.config.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match ChannelManager::from_config(&config, &self.workspace, self.bus.clone()) {
            Ok(manager) => {
                let mut guard = self.channels.write().unwrap_or_else(|e| e.into_inner());
                *guard = Arc::new(manager);
            }
            Err(e) => error!(error = %e, "Failed to rebuild channels, restarting the previous set"),
        }
    }

    /// Runs until [`Supervisor::shutdown`] or until the bus closes.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.set_state(SupervisorState::Starting);
        let mut inbound = self.bus.subscribe_inbound()?;
        let limit = Arc::new(Semaphore::new(self.settings.max_concurrent_turns));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut turns = CancellationToken::new();
        let mut queue = TurnQueue::default();

        let evictor = self
            .agent
            .sessions()
            .spawn_evictor(self.settings.session_idle, self.shutdown.child_token());
        let mut adapters = self.start_adapters();
        self.set_state(SupervisorState::Running);

        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.restart.notified() => {
                    self.set_state(SupervisorState::Draining);
                    self.drain(&mut workers, &turns).await;
                    if turns.is_cancelled() {
                        turns = CancellationToken::new();
                    }
                    self.stop_adapters(adapters).await;
                    self.rebuild_channels().await;
                    queue.prune();
                    adapters = self.start_adapters();
                    self.set_state(SupervisorState::Running);
                    continue;
                }
                Some(res) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!(error = %e, "Agent turn panicked");
                        }
                    }
                    if queue.len() > workers.len() {
                        queue.prune();
                    }
                    continue;
                }
                // Not pulled while every worker is busy; the bus buffers.
                msg = inbound.recv(), if limit.available_permits() > 0 => match msg {
                    Some(m) => m,
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },
            };
            let permit = match Arc::clone(&limit).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => match Arc::clone(&limit).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            debug!(channel = %msg.channel_id, chat = %msg.chat_id, "Dispatching inbound message");
            self.spawn_turn(&mut workers, &mut queue, permit, msg, turns.clone());
        }

        self.set_state(SupervisorState::Draining);
        // Close inbound first so adapters fail fast instead of queueing.
        inbound.close();
        self.drain(&mut workers, &turns).await;
        self.stop_adapters(adapters).await;
        self.shutdown.cancel();
        let _ = evictor.await;
        self.bus.close();
        self.set_state(SupervisorState::Stopped);
        info!("Supervisor stopped");
        Ok(())
    }
}
