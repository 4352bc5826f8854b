use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use beacon_controller::ControllerSummary;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl From<bool> for ConnectionState {
    fn from(connected: bool) -> Self {
        if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Receives periodic status updates
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// `hub` names the assigned hub while connected
    async fn connection(&self, state: ConnectionState, hub: Option<&str>, checked_at: DateTime<Utc>);

    async fn controllers(&self, summaries: &[ControllerSummary]);
}

/// Writes status updates to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatus;

#[async_trait]
impl StatusSink for LogStatus {
    async fn connection(&self, state: ConnectionState, hub: Option<&str>, checked_at: DateTime<Utc>) {
        match (state, hub) {
            (ConnectionState::Connected, Some(hub)) => {
                info!(%checked_at, %hub, "uplink status: {state}")
            }
            (ConnectionState::Connected, None) => info!(%checked_at, "uplink status: {state}"),
            (ConnectionState::Disconnected, _) => warn!(%checked_at, "uplink status: {state}"),
        }
    }

    async fn controllers(&self, summaries: &[ControllerSummary]) {
        for summary in summaries {
            info!(
                address = %summary.address,
                session = summary.has_session,
                "controller {}: {} point groups",
                summary.name,
                summary.groups.len()
            );
        }
    }
}
