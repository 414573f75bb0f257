pub mod agent;
pub mod bus;
pub mod context;
pub mod session;

pub use agent::{Agent, AgentSettings, TurnOutcome, TurnStatus};
pub use bus::MessageBus;
pub use context::ContextBuilder;
pub use session::{Session, SessionHandle, SessionStore, SessionSummary};
