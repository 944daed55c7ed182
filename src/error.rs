//! Error types for the BITalino client.
//!
//! Three layers, each with its own enum:
//!
//! | Type | Raised by | Fatal? |
//! |---|---|---|
//! | [`DecodeError`] | [`crate::parse::decode_frame`] | never — the frame is dropped |
//! | [`TransportError`] | [`crate::transport::Transport`] implementations | mapped by the caller |
//! | [`BitalinoError`] | [`crate::client::BitalinoClient`] operations | never — state is always rolled back |

use thiserror::Error;

use crate::types::ConnectionState;

/// A notification payload that could not be turned into a [`crate::types::Sample`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frames need the sequence/digital byte plus at least one more byte.
    #[error("frame too short: {len} byte(s), need at least 2")]
    FrameTooShort { len: usize },
}

/// Failure reported by a platform transport.
///
/// Transports do not know which client operation they are serving; the
/// state machine maps these into [`BitalinoError`] based on the phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The host has no usable Bluetooth adapter.
    #[error("no Bluetooth adapter available")]
    Unavailable,

    /// Device selection was aborted before a peripheral was chosen.
    #[error("device selection cancelled")]
    Cancelled,

    #[error("no matching device found: {0}")]
    NotFound(String),

    #[error("{0} timed out")]
    Timeout(String),

    /// The link is gone; the operation could not be issued.
    #[error("device not connected")]
    NotConnected,

    /// Anything else the BLE stack reported.
    #[error("BLE error: {0}")]
    Ble(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::PermissionDenied => TransportError::Unavailable,
            btleplug::Error::TimedOut(d) => {
                TransportError::Timeout(format!("BLE call after {d:?}"))
            }
            other => TransportError::Ble(other.to_string()),
        }
    }
}

/// Error returned by [`crate::client::BitalinoClient`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitalinoError {
    #[error("Bluetooth is not available on this host")]
    CapabilityUnavailable,

    #[error("device selection was cancelled")]
    SelectionCancelled,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("already connected")]
    AlreadyConnected,

    #[error("a connection attempt is already in progress")]
    ConnectionInProgress,

    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("command write failed: {0}")]
    WriteFailed(String),

    #[error("notification subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("notification unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    /// The operation requires a connected device but the state is `{0}`.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("already streaming")]
    AlreadyStreaming,

    /// The same operation is already pending; calls are rejected, not queued.
    #[error("{0} is already in progress")]
    OperationInProgress(&'static str),

    /// An unsolicited disconnect arrived while the operation was in flight.
    #[error("device disconnected during {0}")]
    Disconnected(&'static str),
}

pub type Result<T, E = BitalinoError> = std::result::Result<T, E>;
