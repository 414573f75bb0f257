pub mod backoff;
pub mod base;
#[cfg(feature = "discord")]
pub mod discord;
#[cfg(feature = "feishu")]
pub mod feishu;
pub mod manager;
#[cfg(feature = "slack")]
pub mod slack;
#[cfg(feature = "telegram")]
pub mod telegram;
pub mod util;
#[cfg(feature = "whatsapp")]
pub mod whatsapp;
#[cfg(feature = "whatsapp")]
pub mod whatsapp_store;

#[cfg(test)]
mod test_support;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use switchboard_core::{OutboundMessage, Result};
use tokio_util::sync::CancellationToken;

pub use base::{AllowList, BaseChannel};
pub use manager::{ChannelManager, ChannelStatus};

/// Lifecycle state of an adapter as reported to the supervisor and admin UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Stopped,
    Starting,
    /// Waiting for the user to scan a pairing QR code.
    Pairing,
    Running,
    Reconnecting,
    /// Credentials rejected or session revoked. Terminal until reconfigured.
    LoggedOut,
    Failed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Starting => "starting",
            ChannelState::Pairing => "pairing",
            ChannelState::Running => "running",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::LoggedOut => "logged_out",
            ChannelState::Failed => "failed",
        }
    }
}

/// One chat-platform transport bridged onto the message bus.
///
/// Shared behaviour (allow-list, running flag, inbound publishing, background
/// task ownership) lives in the [`BaseChannel`] each adapter embeds.
#[async_trait]
pub trait Channel: Send + Sync {
    fn base(&self) -> &BaseChannel;

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Returns once the transport is ready to receive events, or pairing has
    /// completed. The event loop keeps running in a task owned by the
    /// adapter until `stop` or until `cancel` trips.
    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()>;

    /// Tears down network resources within the adapter's grace period.
    async fn stop(&self) -> Result<()> {
        self.base().shutdown().await;
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    fn running(&self) -> bool {
        self.base().running()
    }

    fn state(&self) -> ChannelState {
        self.base().state()
    }
}
