pub mod admin;
pub mod identities;
pub mod log_ring;
pub mod supervisor;

use std::sync::{Arc, RwLock};
use switchboard_core::Config;

/// Live configuration shared by the supervisor and the admin API. Readers
/// take the read lock; a save holds the write lock across write + swap.
pub type SharedConfig = Arc<RwLock<Config>>;

pub use admin::{router, serve, AdminState};
pub use identities::{Identity, IdentityStore};
pub use log_ring::{LogEntry, LogRing, LogRingLayer};
pub use supervisor::{Supervisor, SupervisorSettings, SupervisorState};
