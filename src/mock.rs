//! Scripted in-memory [`Transport`] for tests and demos.
//!
//! ```
//! # use bitalino_ble::mock::{MockStep, MockTransport};
//! # use bitalino_ble::error::TransportError;
//! let mock = MockTransport::new();
//! mock.fail(MockStep::Write, TransportError::Ble("GATT write rejected".into()));
//! ```
//!
//! Characteristics are identified by their UUID.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{NOTIFY_CHARACTERISTIC, UART_SERVICE_UUID};
use crate::transport::{DeviceFilter, Session, Transport, TransportEvent};
use crate::types::DeviceIdentity;

/// Transport operations that can be failed or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Select,
    Connect,
    Resolve,
    Write,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

/// One recorded transport call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Select,
    Connect(String),
    Resolve,
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    Disconnect,
}

/// Parks one call to a held [`MockStep`] until released.
#[derive(Clone)]
pub struct MockGate {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl MockGate {
    /// Resolves once the held step has been entered.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the held step continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    failures: HashMap<MockStep, TransportError>,
    holds: HashMap<MockStep, MockGate>,
    events: Option<mpsc::Sender<TransportEvent>>,
    connected: bool,
    subscribed: bool,
}

pub struct MockTransport {
    device: DeviceIdentity,
    advertised: Vec<Uuid>,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// A single named BITalino advertising the UART service.
    pub fn new() -> Self {
        Self::with_device(DeviceIdentity::new(
            "20:16:07:18:15:44",
            Some("BITalino-15-44".into()),
        ))
    }

    pub fn with_device(device: DeviceIdentity) -> Self {
        Self {
            device,
            advertised: vec![UART_SERVICE_UUID],
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make every call to `step` fail with `err` until [`Self::clear_failures`].
    pub fn fail(&self, step: MockStep, err: TransportError) {
        self.state.lock().failures.insert(step, err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Park the next call to `step` until the returned gate is released.
    pub fn hold(&self, step: MockStep) -> MockGate {
        let gate = MockGate {
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        self.state.lock().holds.insert(step, gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    /// Push a notification on the TX characteristic.
    ///
    /// Returns `false` when no client is listening.
    pub async fn notify(&self, value: &[u8]) -> bool {
        self.notify_from(NOTIFY_CHARACTERISTIC, value).await
    }

    pub async fn notify_from(&self, characteristic: Uuid, value: &[u8]) -> bool {
        self.push(TransportEvent::Notification {
            characteristic,
            value: value.to_vec(),
        })
        .await
    }

    /// Simulate the device going away (powered off, out of range).
    pub async fn drop_link(&self) -> bool {
        {
            let mut st = self.state.lock();
            st.connected = false;
            st.subscribed = false;
        }
        self.push(TransportEvent::Disconnected).await
    }

    async fn push(&self, event: TransportEvent) -> bool {
        let tx = self.state.lock().events.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Record the call, wait on a hold if any, then apply a scripted failure.
    async fn enter(&self, step: MockStep, call: MockCall) -> Result<(), TransportError> {
        let gate = {
            let mut st = self.state.lock();
            st.calls.push(call);
            st.holds.remove(&step)
        };
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        match self.state.lock().failures.get(&step) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn require_link(&self) -> Result<(), TransportError> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Characteristic = Uuid;

    async fn select_device(&self, filter: &DeviceFilter) -> Result<DeviceIdentity, TransportError> {
        self.enter(MockStep::Select, MockCall::Select).await?;
        if filter.matches(&self.device.id, self.device.name.as_deref(), &self.advertised) {
            Ok(self.device.clone())
        } else {
            Err(TransportError::NotFound("no device matched the filter".into()))
        }
    }

    async fn connect(
        &self,
        device: &DeviceIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.enter(MockStep::Connect, MockCall::Connect(device.id.clone()))
            .await?;
        let mut st = self.state.lock();
        st.connected = true;
        st.events = Some(events);
        Ok(())
    }

    async fn resolve(
        &self,
        service: Uuid,
        write: Uuid,
        notify: Uuid,
    ) -> Result<Session<Uuid>, TransportError> {
        self.enter(MockStep::Resolve, MockCall::Resolve).await?;
        self.require_link()?;
        Ok(Session {
            service,
            write,
            notify,
        })
    }

    async fn write(&self, characteristic: &Uuid, payload: &[u8]) -> Result<(), TransportError> {
        self.enter(MockStep::Write, MockCall::Write(*characteristic, payload.to_vec()))
            .await?;
        self.require_link()
    }

    async fn subscribe(&self, characteristic: &Uuid) -> Result<(), TransportError> {
        self.enter(MockStep::Subscribe, MockCall::Subscribe(*characteristic))
            .await?;
        self.require_link()?;
        self.state.lock().subscribed = true;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &Uuid) -> Result<(), TransportError> {
        self.enter(MockStep::Unsubscribe, MockCall::Unsubscribe(*characteristic))
            .await?;
        self.require_link()?;
        self.state.lock().subscribed = false;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.enter(MockStep::Disconnect, MockCall::Disconnect).await?;
        let mut st = self.state.lock();
        st.connected = false;
        st.subscribed = false;
        st.events = None;
        Ok(())
    }
}
