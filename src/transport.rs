//! The platform seam: everything the client needs from a BLE stack.
//!
//! [`crate::client::BitalinoClient`] never talks to Bluetooth directly. It
//! drives a [`Transport`] through select → connect → resolve, then issues
//! writes and (un)subscriptions. Asynchronous traffic from the peripheral
//! (notifications and link loss) flows back through the bounded
//! [`TransportEvent`] channel handed over in [`Transport::connect`].
//!
//! Implementations:
//! * [`crate::ble::BtleplugTransport`] — desktop BLE via `btleplug`
//! * [`crate::mock::MockTransport`] — scripted fake for tests

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::UART_SERVICE_UUID;
use crate::types::DeviceIdentity;

/// Asynchronous traffic pushed by a transport after [`Transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A characteristic-value-changed notification.
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// The link dropped without the client asking for it.
    Disconnected,
}

/// Resolved GATT handles for one connection.
///
/// Held only by the client's state machine and cleared on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<C> {
    pub service: Uuid,
    /// Host → device (RX).
    pub write: C,
    /// Device → host (TX).
    pub notify: C,
}

/// Which peripheral [`Transport::select_device`] should pick.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    /// Exact platform id. Takes precedence over the other criteria.
    pub device_id: Option<String>,
    /// Match advertised names starting with this string.
    pub name_prefix: Option<String>,
    /// Give up selecting after this long.
    pub scan_timeout: Duration,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            device_id: None,
            name_prefix: None,
            scan_timeout: Duration::from_secs(15),
        }
    }
}

impl DeviceFilter {
    /// Does an advertised peripheral match?
    ///
    /// Precedence: explicit id, then name prefix, then the UART service
    /// UUID in the advertisement.
    pub fn matches(&self, id: &str, name: Option<&str>, services: &[Uuid]) -> bool {
        if let Some(want) = &self.device_id {
            return want.eq_ignore_ascii_case(id);
        }
        if let Some(prefix) = &self.name_prefix {
            return name.is_some_and(|n| n.starts_with(prefix.as_str()));
        }
        services.contains(&UART_SERVICE_UUID)
    }
}

/// BLE primitives supplied by the host platform.
///
/// One transport serves one peripheral at a time. Every method may suspend;
/// none may block a worker thread.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Platform handle for a resolved characteristic.
    type Characteristic: Clone + Send + Sync + 'static;

    /// Scan for and pick a peripheral.
    ///
    /// Returns [`TransportError::Unavailable`] without a Bluetooth adapter
    /// and [`TransportError::Cancelled`] if selection was aborted.
    async fn select_device(&self, filter: &DeviceFilter) -> Result<DeviceIdentity, TransportError>;

    /// Open the GATT session. From now on notifications and link loss are
    /// pushed into `events` until [`Transport::disconnect`] is called.
    async fn connect(
        &self,
        device: &DeviceIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Look up the service and its write/notify characteristics.
    async fn resolve(
        &self,
        service: Uuid,
        write: Uuid,
        notify: Uuid,
    ) -> Result<Session<Self::Characteristic>, TransportError>;

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, characteristic: &Self::Characteristic) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: &Self::Characteristic)
        -> Result<(), TransportError>;

    /// Close the GATT session. A no-op when nothing is connected.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
