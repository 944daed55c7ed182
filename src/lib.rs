//! # bitalino-ble
//!
//! Async Rust client for streaming biosignal data from
//! [BITalino](https://www.pluxbiosignals.com/pages/bitalino) boards over
//! Bluetooth Low Energy.
//!
//! The board exposes the Nordic UART Service: the host writes start/stop
//! commands to the RX characteristic and receives one compact frame per
//! notification on TX. Each frame carries a 4-bit sequence counter, the
//! digital input nibble and one big-endian 16-bit reading per active
//! analog channel.
//!
//! ## Quick start
//!
//! ```no_run
//! use bitalino_ble::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BitalinoClient::new(BtleplugTransport::default(), BitalinoClientConfig::default());
//!     let mut rx = client.subscribe();
//!
//!     client.connect().await?;
//!     client.start_streaming(StreamConfig::new(1000, vec![0, 1])).await?;
//!
//!     while let Ok(event) = rx.recv().await {
//!         match event {
//!             BitalinoEvent::Sample(s) => println!("seq={} analog={:?}", s.sequence, s.analog),
//!             BitalinoEvent::Disconnected { .. } => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`client`] | Connection state machine and [`client::BitalinoClient`] |
//! | [`streaming`] | Start/stop sequencing on the client |
//! | [`transport`] | The [`transport::Transport`] trait the platform supplies |
//! | [`ble`] | `btleplug` transport for desktop platforms |
//! | [`mock`] | Scripted transport for tests |
//! | [`status`] | Status snapshot and event fan-out |
//! | [`types`] | Samples, configuration, events, status |
//! | [`protocol`] | GATT UUIDs and command encoders |
//! | [`parse`] | Notification frame decoder |
//! | [`error`] | Error types |

pub mod ble;
pub mod client;
pub mod error;
pub mod mock;
pub mod parse;
pub mod protocol;
pub mod status;
pub mod streaming;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::ble::{BtleplugConfig, BtleplugTransport};
    pub use crate::client::{BitalinoClient, BitalinoClientConfig};
    pub use crate::streaming::StopOutcome;
    pub use crate::transport::{DeviceFilter, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::error::{BitalinoError, DecodeError, TransportError};
    pub use crate::types::{
        BitalinoEvent, ConnectionState, DeviceIdentity, Sample, Status, StreamConfig,
    };

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{NOTIFY_CHARACTERISTIC, UART_SERVICE_UUID, WRITE_CHARACTERISTIC};
}
