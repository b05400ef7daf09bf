//! Error types for the wand engine

use thiserror::Error;
use uuid::Uuid;

use crate::infrastructure::bluetooth::transport::TransportError;

/// Errors surfaced by the protocol and sniffer sessions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WandError {
    #[error("Bluetooth LE is not available on this host")]
    TransportUnavailable,

    #[error("No wand found")]
    DeviceNotFound,

    #[error("Failed to connect: {0}")]
    ConnectFailure(String),

    #[error("Failed to write to wand: {0}")]
    WriteFailure(String),

    #[error("Failed to subscribe to {characteristic}: {reason}")]
    SubscribeFailure { characteristic: Uuid, reason: String },

    #[error("No notifiable characteristic could be subscribed")]
    NoSubscriptions,

    #[error("Not connected")]
    NotConnected,

    #[error("Macro is empty")]
    EmptyMacro,

    #[error("Invalid color {0:?}: expected 6 hex digits")]
    InvalidColor(String),

    #[error("Invalid opcode {0:?}: expected a value in 0..=255")]
    InvalidOpcode(String),

    #[error("Invalid command {0:?}")]
    InvalidCommand(String),

    #[error("Invalid UUID {0:?}")]
    InvalidUuid(String),

    #[error("Session task has stopped")]
    SessionClosed,
}

impl WandError {
    /// Map a transport failure raised while establishing a link
    pub(crate) fn connect(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => Self::TransportUnavailable,
            other => Self::ConnectFailure(other.to_string()),
        }
    }
}

pub type WandResult<T> = Result<T, WandError>;
