pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::{Config, FlexibleStringList};
pub use error::{Error, Result};
pub use message::{Attachment, ChatType, InboundMessage, OutboundMessage};
pub use paths::{Paths, Workspace, PERSONA_FILES};
