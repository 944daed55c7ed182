//! Connection state machine for a single BITalino peripheral.
//!
//! [`BitalinoClient`] owns everything that lives for one connection: the
//! [`ConnectionState`], the resolved GATT [`Session`], the device identity
//! and the most recent sample. All of it sits behind one lock that is never
//! held across an `.await`, so every transition is atomic as seen from the
//! [`StatusSurface`].
//!
//! # Epochs
//!
//! Each teardown bumps a connection epoch. Operations capture the epoch
//! before their first transport call and re-check it after every await;
//! when it moved, an unsolicited disconnect won the race and the operation
//! fails with [`BitalinoError::Disconnected`] without touching the new
//! state. The notification pump carries the epoch of the connection it was
//! spawned for and ignores everything once that connection is gone.
//!
//! # Backlog
//!
//! Notifications are judged when the pump reads them, not when they were
//! queued. Before entering `Streaming`, [`BitalinoClient::flush_backlog`]
//! sends the pump a fence; the pump drains whatever is already queued
//! (dropping it, since the state is not yet `Streaming`) and only then
//! acknowledges.
//!
//! Streaming (`start_streaming` / `stop_streaming`) lives in
//! [`crate::streaming`].

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{BitalinoError, Result, TransportError};
use crate::parse::decode_frame;
use crate::protocol::{NOTIFY_CHARACTERISTIC, UART_SERVICE_UUID, WRITE_CHARACTERISTIC};
use crate::status::StatusSurface;
use crate::transport::{DeviceFilter, Session, Transport, TransportEvent};
use crate::types::{BitalinoEvent, ConnectionState, DeviceIdentity, Sample, Status};

// ── BitalinoClientConfig ──────────────────────────────────────────────────────

/// Configuration for [`BitalinoClient`].
#[derive(Debug, Clone)]
pub struct BitalinoClientConfig {
    /// Which peripheral to pick during `connect()`.
    pub filter: DeviceFilter,
    /// Broadcast buffer per event subscriber. A subscriber that falls
    /// further behind skips ahead. Default: `256`.
    pub event_capacity: usize,
    /// Bound of the transport → client channel. Default: `256`.
    pub notification_capacity: usize,
}

impl Default for BitalinoClientConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::default(),
            event_capacity: 256,
            notification_capacity: 256,
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub(crate) enum Op {
    Start,
    Stop,
    Disconnect,
}

/// Operations currently awaiting the transport.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pub(crate) start: bool,
    pub(crate) stop: bool,
    pub(crate) disconnect: bool,
}

impl InFlight {
    fn set(&mut self, op: Op, on: bool) {
        match op {
            Op::Start => self.start = on,
            Op::Stop => self.stop = on,
            Op::Disconnect => self.disconnect = on,
        }
    }
}

pub(crate) struct Inner<C> {
    pub(crate) state: ConnectionState,
    pub(crate) device: Option<DeviceIdentity>,
    pub(crate) session: Option<Session<C>>,
    pub(crate) last_sample: Option<Sample>,
    pub(crate) samples_received: u64,
    pub(crate) malformed_frames: u64,
    pub(crate) epoch: u64,
    pub(crate) in_flight: InFlight,
    pump: Option<JoinHandle<()>>,
    fence: Option<mpsc::UnboundedSender<oneshot::Sender<()>>>,
    /// An abandoned `connect()` may have left the transport linked.
    stale_link: bool,
}

impl<C> Inner<C> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device: None,
            session: None,
            last_sample: None,
            samples_received: 0,
            malformed_frames: 0,
            epoch: 0,
            in_flight: InFlight::default(),
            pump: None,
            fence: None,
            stale_link: false,
        }
    }

    pub(crate) fn status(&self) -> Status {
        Status {
            state: self.state,
            device: self.device.clone(),
            last_sample: self.last_sample.clone(),
            streaming: self.state == ConnectionState::Streaming,
            samples_received: self.samples_received,
            malformed_frames: self.malformed_frames,
        }
    }

    /// Drop every per-connection value and start a new epoch.
    ///
    /// Returns the pump handle so the caller can abort it outside the lock.
    fn teardown(&mut self) -> Option<JoinHandle<()>> {
        self.state = ConnectionState::Disconnected;
        self.device = None;
        self.session = None;
        self.last_sample = None;
        self.epoch += 1;
        self.fence = None;
        self.pump.take()
    }
}

pub(crate) struct Shared<C> {
    pub(crate) inner: Mutex<Inner<C>>,
    pub(crate) surface: StatusSurface,
}

impl<C> Shared<C> {
    pub(crate) fn publish(&self, inner: &Inner<C>) {
        self.surface.publish(inner.status());
    }

    /// Frame handler. Active only while the owning connection is streaming.
    fn on_notification(&self, epoch: u64, characteristic: Uuid, value: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Streaming {
            debug!("dropping notification outside streaming ({} bytes)", value.len());
            return;
        }
        if characteristic != NOTIFY_CHARACTERISTIC {
            debug!("ignoring notification from {characteristic}");
            return;
        }
        match decode_frame(value) {
            Ok(sample) => {
                inner.samples_received += 1;
                inner.last_sample = Some(sample.clone());
                self.publish(&inner);
                self.surface.emit(BitalinoEvent::Sample(sample));
            }
            Err(e) => {
                inner.malformed_frames += 1;
                self.publish(&inner);
                warn!("dropping frame: {e}");
            }
        }
    }

    /// Route one transport event. Returns `false` once the link is gone.
    fn dispatch(&self, epoch: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Notification {
                characteristic,
                value,
            } => {
                self.on_notification(epoch, characteristic, &value);
                true
            }
            TransportEvent::Disconnected => {
                self.on_link_lost(epoch);
                false
            }
        }
    }

    /// Link loss reported by the transport. Wins over anything in flight.
    fn on_link_lost(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state == ConnectionState::Disconnected {
            return;
        }
        let was = inner.state;
        // The pump calling us is the handle being dropped here; it exits on
        // its own right after.
        drop(inner.teardown());
        self.publish(&inner);
        self.surface.emit(BitalinoEvent::Disconnected { requested: false });
        info!("device disconnected unexpectedly (was {was})");
    }
}

/// Clears its in-flight flag when the operation finishes or its future is
/// dropped.
pub(crate) struct InFlightGuard<'a, C> {
    shared: &'a Shared<C>,
    op: Op,
}

impl<'a, C> InFlightGuard<'a, C> {
    /// Caller must hold the lock and have checked the flag.
    pub(crate) fn arm(shared: &'a Shared<C>, inner: &mut Inner<C>, op: Op) -> Self {
        inner.in_flight.set(op, true);
        Self { shared, op }
    }
}

impl<C> Drop for InFlightGuard<'_, C> {
    fn drop(&mut self) {
        self.shared.inner.lock().in_flight.set(self.op, false);
    }
}

/// Resets a `Connecting` client whose `connect()` future was dropped.
struct ConnectGuard<'a, C> {
    shared: &'a Shared<C>,
    epoch: u64,
    armed: bool,
}

impl<C> ConnectGuard<'_, C> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C> Drop for ConnectGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.inner.lock();
        if inner.epoch != self.epoch || inner.state != ConnectionState::Connecting {
            return;
        }
        if let Some(pump) = inner.teardown() {
            pump.abort();
        }
        inner.stale_link = true;
        self.shared.publish(&inner);
        warn!("connect abandoned before it finished");
    }
}

// ── BitalinoClient ────────────────────────────────────────────────────────────

/// Client for one BITalino device over a [`Transport`].
///
/// All operations take `&self`; wrap the client in an `Arc` to drive it
/// from several tasks. Repeating an operation that is still pending is
/// rejected rather than queued.
pub struct BitalinoClient<T: Transport> {
    pub(crate) transport: Arc<T>,
    config: BitalinoClientConfig,
    pub(crate) shared: Arc<Shared<T::Characteristic>>,
}

impl<T: Transport> BitalinoClient<T> {
    pub fn new(transport: T, config: BitalinoClientConfig) -> Self {
        Self::from_arc(Arc::new(transport), config)
    }

    pub fn from_arc(transport: Arc<T>, config: BitalinoClientConfig) -> Self {
        let surface = StatusSurface::new(config.event_capacity);
        Self {
            transport,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::new()),
                surface,
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ── Status surface ───────────────────────────────────────────────────────

    pub fn status(&self) -> Status {
        self.shared.surface.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Receiver that always holds the latest [`Status`].
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.surface.watch()
    }

    /// Receive lifecycle events and decoded samples from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BitalinoEvent> {
        self.shared.surface.subscribe()
    }

    // ── Connect ──────────────────────────────────────────────────────────────

    /// Select a device, open its GATT session and resolve the UART
    /// characteristics.
    ///
    /// On failure no partial state is kept and the client is back in
    /// `Disconnected`.
    pub async fn connect(&self) -> Result<DeviceIdentity> {
        let epoch = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Disconnected => {}
                ConnectionState::Connecting => return Err(BitalinoError::ConnectionInProgress),
                ConnectionState::Connected | ConnectionState::Streaming => {
                    return Err(BitalinoError::AlreadyConnected)
                }
            }
            inner.state = ConnectionState::Connecting;
            inner.samples_received = 0;
            inner.malformed_frames = 0;
            self.shared.publish(&inner);
            inner.epoch
        };

        let mut guard = ConnectGuard {
            shared: &*self.shared,
            epoch,
            armed: true,
        };
        let result = self.establish(epoch).await;
        guard.disarm();

        let mut inner = self.shared.inner.lock();
        if inner.epoch != epoch {
            // Link lost mid-connect; on_link_lost already reset everything.
            if let Err(e) = result {
                debug!("connect error superseded by link loss: {e}");
            }
            return Err(BitalinoError::Disconnected("connect"));
        }
        match result {
            Ok((device, session)) => {
                inner.state = ConnectionState::Connected;
                inner.device = Some(device.clone());
                inner.session = Some(session);
                self.shared.publish(&inner);
                self.shared
                    .surface
                    .emit(BitalinoEvent::Connected(device.clone()));
                info!("Connected to {}", device.display_name());
                Ok(device)
            }
            Err(e) => {
                if let Some(pump) = inner.teardown() {
                    pump.abort();
                }
                self.shared.publish(&inner);
                warn!("connect failed: {e}");
                Err(e)
            }
        }
    }

    async fn establish(&self, epoch: u64) -> Result<(DeviceIdentity, Session<T::Characteristic>)> {
        let stale = std::mem::take(&mut self.shared.inner.lock().stale_link);
        if stale {
            if let Err(e) = self.transport.disconnect().await {
                debug!("closing link left by an abandoned connect: {e}");
            }
        }

        let device = self
            .transport
            .select_device(&self.config.filter)
            .await
            .map_err(connect_error)?;
        info!("Selected {} ({})", device.display_name(), device.id);

        let (tx, rx) = mpsc::channel(self.config.notification_capacity.max(1));
        self.spawn_pump(rx, epoch);

        self.transport
            .connect(&device, tx)
            .await
            .map_err(connect_error)?;

        match self
            .transport
            .resolve(UART_SERVICE_UUID, WRITE_CHARACTERISTIC, NOTIFY_CHARACTERISTIC)
            .await
        {
            Ok(session) => Ok((device, session)),
            Err(e) => {
                if let Err(de) = self.transport.disconnect().await {
                    warn!("cleanup disconnect after failed resolve: {de}");
                }
                Err(connect_error(e))
            }
        }
    }

    /// Drain transport traffic for the connection identified by `epoch`.
    ///
    /// Fence requests take priority over traffic so a flush sees exactly
    /// the backlog queued before it.
    fn spawn_pump(&self, mut rx: mpsc::Receiver<TransportEvent>, epoch: u64) {
        let shared = Arc::clone(&self.shared);
        let (fence_tx, mut fence_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let handle = tokio::spawn(async move {
            'pump: loop {
                tokio::select! {
                    biased;
                    Some(ack) = fence_rx.recv() => {
                        while let Ok(event) = rx.try_recv() {
                            if !shared.dispatch(epoch, event) {
                                break 'pump;
                            }
                        }
                        let _ = ack.send(());
                    }
                    event = rx.recv() => match event {
                        Some(event) => {
                            if !shared.dispatch(epoch, event) {
                                break 'pump;
                            }
                        }
                        None => break 'pump,
                    },
                }
            }
            debug!("notification pump for connection #{epoch} finished");
        });

        let mut inner = self.shared.inner.lock();
        if inner.epoch == epoch {
            if let Some(old) = inner.pump.replace(handle) {
                old.abort();
            }
            inner.fence = Some(fence_tx);
        } else {
            handle.abort();
        }
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Stop streaming if needed (best-effort), then close the GATT session.
    ///
    /// A no-op when already disconnected. Rejected while a
    /// `start_streaming` is still awaiting the device.
    pub async fn disconnect(&self) -> Result<()> {
        let (epoch, streaming, _guard) = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Connecting => return Err(BitalinoError::ConnectionInProgress),
                ConnectionState::Connected | ConnectionState::Streaming => {}
            }
            if inner.in_flight.disconnect {
                return Err(BitalinoError::OperationInProgress("disconnect"));
            }
            if inner.in_flight.start {
                return Err(BitalinoError::OperationInProgress("start_streaming"));
            }
            let streaming = inner.state == ConnectionState::Streaming;
            let guard = InFlightGuard::arm(&self.shared, &mut inner, Op::Disconnect);
            (inner.epoch, streaming, guard)
        };

        if streaming {
            if let Err(e) = self.stop_streaming().await {
                warn!("stop before disconnect failed, continuing: {e}");
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("transport disconnect failed, clearing session anyway: {e}");
        }

        let pump = {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                // The link went away on its own while we were shutting down.
                return Ok(());
            }
            let pump = inner.teardown();
            self.shared.publish(&inner);
            self.shared
                .surface
                .emit(BitalinoEvent::Disconnected { requested: true });
            pump
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        info!("Disconnected");
        Ok(())
    }

    /// Wait until the pump has processed every event queued so far.
    ///
    /// Returns early if the pump is gone; callers re-check the epoch.
    pub(crate) async fn flush_backlog(&self) {
        let fence = self.shared.inner.lock().fence.clone();
        let Some(fence) = fence else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if fence.send(ack_tx).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Fail with [`BitalinoError::Disconnected`] if the connection seen at
    /// `epoch` is gone.
    pub(crate) fn ensure_epoch(&self, epoch: u64, op: &'static str) -> Result<()> {
        if self.shared.inner.lock().epoch == epoch {
            Ok(())
        } else {
            Err(BitalinoError::Disconnected(op))
        }
    }
}

fn connect_error(e: TransportError) -> BitalinoError {
    match e {
        TransportError::Unavailable => BitalinoError::CapabilityUnavailable,
        TransportError::Cancelled => BitalinoError::SelectionCancelled,
        other => BitalinoError::ConnectFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_mapping() {
        assert_eq!(
            connect_error(TransportError::Unavailable),
            BitalinoError::CapabilityUnavailable
        );
        assert_eq!(
            connect_error(TransportError::Cancelled),
            BitalinoError::SelectionCancelled
        );
        assert_eq!(
            connect_error(TransportError::Timeout("BLE connect".into())),
            BitalinoError::ConnectFailed("BLE connect timed out".into())
        );
    }

    #[test]
    fn test_teardown_bumps_epoch_and_clears() {
        let mut inner: Inner<u8> = Inner::new();
        inner.state = ConnectionState::Streaming;
        inner.device = Some(DeviceIdentity::new("id", None));
        inner.session = Some(Session {
            service: UART_SERVICE_UUID,
            write: 2,
            notify: 3,
        });
        inner.samples_received = 7;
        assert!(inner.teardown().is_none());
        let status = inner.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.streaming);
        assert!(status.device.is_none());
        assert!(inner.session.is_none());
        assert_eq!(inner.epoch, 1);
        // Counters survive until the next connect.
        assert_eq!(status.samples_received, 7);
    }
}
