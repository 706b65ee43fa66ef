use std::fmt;

use serde::Serialize;

pub type Topic = String;
pub type SubscriberId = String;
pub type ResourceKey = String;

/// Join state of one channel entry. `Connected` and `Error` are terminal for
/// the lifetime of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Connection state as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel exists for the topic.
    Idle,
    Connecting,
    Connected,
    /// The join failed; carries the human-readable reason.
    Error(String),
}

impl ConnectionState {
    pub fn status(&self) -> Option<ChannelStatus> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::Connecting => Some(ChannelStatus::Connecting),
            ConnectionState::Connected => Some(ChannelStatus::Connected),
            ConnectionState::Error(_) => Some(ChannelStatus::Error),
        }
    }

    pub fn from_status(status: ChannelStatus, reason: Option<&str>) -> Self {
        match status {
            ChannelStatus::Connecting => ConnectionState::Connecting,
            ChannelStatus::Connected => ConnectionState::Connected,
            ChannelStatus::Error => {
                ConnectionState::Error(reason.unwrap_or("channel error").to_string())
            }
        }
    }
}
