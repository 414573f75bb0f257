use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use switchboard_core::types::ChatMessage;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Conversation state for one session key. Never holds the system prompt;
/// that is rebuilt for every turn.
#[derive(Debug)]
pub struct Session {
    pub key: String,
    pub history: Vec<ChatMessage>,
    pub last_activity: Instant,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            history: Vec::new(),
            last_activity: Instant::now(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub key: String,
    pub messages: usize,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Concurrent map from session key to a per-session async mutex.
///
/// The outer lock only guards map membership and is never held across an
/// await; the per-session lock is what serializes turns for one user.
#[derive(Default)]
pub struct SessionStore {
    sessions: StdMutex<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &str) -> SessionHandle {
        let mut map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| {
                debug!(session = %key, "Session created");
                Arc::new(Mutex::new(Session::new(key)))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<SessionHandle> {
        let map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handles(&self) -> Vec<SessionHandle> {
        let map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }

    /// Summaries of sessions whose key starts with `prefix`, newest first.
    /// Sessions mid-turn are skipped rather than waited on.
    pub fn list(&self, prefix: &str) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .handles()
            .into_iter()
            .filter_map(|handle| {
                let session = handle.try_lock().ok()?;
                if !session.key.starts_with(prefix) {
                    return None;
                }
                let preview = session
                    .history
                    .iter()
                    .find(|m| m.role == "user")
                    .map(|m| m.text().chars().take(60).collect())
                    .unwrap_or_default();
                Some(SessionSummary {
                    key: session.key.clone(),
                    messages: session.history.len(),
                    preview,
                    created_at: session.created_at,
                    updated_at: session.updated_at,
                })
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Drops sessions idle for longer than `idle`. A session whose lock is
    /// held is in a turn and therefore not idle.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, handle| match handle.try_lock() {
            Ok(session) => session.last_activity.elapsed() < idle,
            Err(_) => true,
        });
        before - map.len()
    }

    /// Periodic eviction until `cancel` trips.
    pub fn spawn_evictor(self: &Arc<Self>, idle: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let period = (idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = store.evict_idle(idle);
                        if evicted > 0 {
                            info!(evicted, remaining = store.len(), "Evicted idle sessions");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let store = SessionStore::new();
        let a = store.get_or_create("telegram:1");
        let b = store.get_or_create("telegram:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);

        a.lock().await.history.push(ChatMessage::user("hi"));
        assert_eq!(b.lock().await.history.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_is_atomic() {
        let store = Arc::new(SessionStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let s = Arc::clone(&store);
            tasks.push(tokio::spawn(async move { s.get_or_create("k") }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_busy_sessions() {
        let store = SessionStore::new();
        let idle = store.get_or_create("idle");
        let busy = store.get_or_create("busy");
        idle.lock().await.last_activity = Instant::now() - Duration::from_secs(120);
        let mut guard = busy.lock().await;
        guard.last_activity = Instant::now() - Duration::from_secs(120);

        assert_eq!(store.evict_idle(Duration::from_secs(60)), 1);
        assert!(store.get("idle").is_none());
        assert!(store.get("busy").is_some());
        drop(guard);
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let store = SessionStore::new();
        store.get_or_create("webui:a").lock().await.history.push(ChatMessage::user("hello there"));
        store.get_or_create("telegram:1");

        let list = store.list("webui:");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key, "webui:a");
        assert_eq!(list[0].preview, "hello there");
        assert_eq!(store.list("").len(), 2);
    }
}
