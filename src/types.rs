use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BitalinoError;
use crate::protocol::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE_HZ, MAX_CHANNEL_INDEX};

/// A BITalino peripheral found during device selection.
///
/// Immutable once discovered; dropped when the session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// Platform BLE identifier.
    /// • macOS / Windows — a UUID string
    /// • Linux — a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    /// Advertised local name, if the peripheral sent one.
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// The advertised name, or a generic label for unnamed peripherals.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("BITalino device")
    }
}

/// Connection lifecycle of a [`crate::client::BitalinoClient`].
///
/// ```text
/// Disconnected ──connect()──▶ Connecting ──ok──▶ Connected ◀──stop── Streaming
///      ▲                          │                  │  └──start──▶────┘
///      └──────── error ───────────┘                  │
///      └──────── disconnect() / link lost ───────────┘ (from any state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Streaming => "Streaming",
        };
        f.write_str(s)
    }
}

/// Acquisition settings sent to the device with the start command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Sampling frequency in Hz. Must fit the 16-bit wire field.
    pub sample_rate_hz: u32,
    /// Analog channel indices (0–5) in the order the device should report them.
    pub channels: Vec<u8>,
}

impl Default for StreamConfig {
    /// 1000 Hz on channels A1 and A2.
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            channels: DEFAULT_CHANNELS.to_vec(),
        }
    }
}

impl StreamConfig {
    pub fn new(sample_rate_hz: u32, channels: impl Into<Vec<u8>>) -> Self {
        Self {
            sample_rate_hz,
            channels: channels.into(),
        }
    }

    /// Check the configuration against what the device accepts.
    ///
    /// Stricter than the start-command encoder: besides the wire limits it
    /// rejects channel indices above 5 and repeated channels. An empty
    /// channel list is allowed.
    pub fn validate(&self) -> Result<(), BitalinoError> {
        if self.sample_rate_hz == 0 || self.sample_rate_hz > u16::MAX as u32 {
            return Err(BitalinoError::InvalidConfig(format!(
                "sample rate {} Hz is outside 1..=65535",
                self.sample_rate_hz
            )));
        }
        if let Some(&ch) = self.channels.iter().find(|&&ch| ch > MAX_CHANNEL_INDEX) {
            return Err(BitalinoError::InvalidConfig(format!(
                "channel {ch} is outside 0..={MAX_CHANNEL_INDEX}"
            )));
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if self.channels[..i].contains(ch) {
                return Err(BitalinoError::InvalidConfig(format!(
                    "channel {ch} is listed more than once"
                )));
            }
        }
        Ok(())
    }
}

/// One decoded notification frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// 4-bit rolling frame counter (0–15). Gaps and wraparound are passed
    /// through untouched.
    pub sequence: u8,
    /// Digital input nibble from the first payload byte.
    pub digital: Vec<u8>,
    /// Raw 16-bit analog readings in channel order.
    pub analog: Vec<u16>,
    /// Wall-clock arrival time in milliseconds since Unix epoch.
    ///
    /// The device does not timestamp frames; this is stamped by the host
    /// when the notification is decoded.
    pub timestamp: f64,
}

/// Read-only snapshot published by [`crate::client::BitalinoClient`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Status {
    pub state: ConnectionState,
    pub device: Option<DeviceIdentity>,
    /// Most recent sample decoded during the current streaming session.
    pub last_sample: Option<Sample>,
    /// `true` exactly when `state` is [`ConnectionState::Streaming`].
    pub streaming: bool,
    /// Samples decoded since the device connected.
    pub samples_received: u64,
    /// Notifications dropped because they could not be decoded.
    pub malformed_frames: u64,
}

/// Events fanned out to every subscriber of
/// [`crate::client::BitalinoClient::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum BitalinoEvent {
    /// GATT session established and both characteristics resolved.
    Connected(DeviceIdentity),
    /// The start command was accepted; samples follow.
    StreamingStarted(StreamConfig),
    /// A decoded frame. Only produced while streaming.
    Sample(Sample),
    /// Streaming ended and the notification handler was removed.
    StreamingStopped,
    /// The session is gone.
    ///
    /// `requested` is `false` when the link dropped on its own (device
    /// powered off, out of range). No further samples follow either way.
    Disconnected { requested: bool },
}
