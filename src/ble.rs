//! [`Transport`] implementation on top of `btleplug` (BlueZ, CoreBluetooth,
//! WinRT).

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{DeviceFilter, Session, Transport, TransportEvent};
use crate::types::DeviceIdentity;

// ── BtleplugConfig ────────────────────────────────────────────────────────────

/// Timeouts for the btleplug transport.
#[derive(Debug, Clone)]
pub struct BtleplugConfig {
    /// Hard limit on `Peripheral::connect`. BlueZ can block forever when the
    /// device is out of range. Default: 10 s.
    pub connect_timeout: Duration,
    /// Hard limit on GATT service discovery. Default: 15 s.
    pub discovery_timeout: Duration,
}

impl Default for BtleplugConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
        }
    }
}

// ── BtleplugTransport ─────────────────────────────────────────────────────────

struct Found {
    identity: DeviceIdentity,
    peripheral: Peripheral,
    adapter: Adapter,
}

struct Link {
    peripheral: Peripheral,
    /// Disconnect watcher and notification forwarder.
    tasks: Vec<JoinHandle<()>>,
}

/// Desktop BLE transport.
///
/// Devices found by [`BtleplugTransport::scan_all`] or
/// [`Transport::select_device`] are remembered so that
/// [`Transport::connect`] can be called with just their identity.
pub struct BtleplugTransport {
    config: BtleplugConfig,
    found: Mutex<Vec<Found>>,
    link: Mutex<Option<Link>>,
}

impl BtleplugTransport {
    pub fn new(config: BtleplugConfig) -> Self {
        Self {
            config,
            found: Mutex::new(Vec::new()),
            link: Mutex::new(None),
        }
    }

    /// Scan for the full `filter.scan_timeout` and return every match.
    pub async fn scan_all(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Vec<DeviceIdentity>, TransportError> {
        let adapter = first_adapter().await?;
        info!("scan_all: scanning for {:?} …", filter.scan_timeout);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(filter.scan_timeout).await;
        adapter.stop_scan().await.ok();

        let mut out = Vec::new();
        for p in adapter.peripherals().await? {
            if let Some(identity) = matching_identity(&p, filter).await {
                info!("scan_all: found {}  id={}", identity.display_name(), identity.id);
                out.push(identity.clone());
                self.remember(Found {
                    identity,
                    peripheral: p,
                    adapter: adapter.clone(),
                })
                .await;
            }
        }
        info!("scan_all: {} device(s) found", out.len());
        Ok(out)
    }

    async fn remember(&self, found: Found) {
        let mut list = self.found.lock().await;
        list.retain(|f| f.identity.id != found.identity.id);
        list.push(found);
    }

    async fn peripheral(&self) -> Result<Peripheral, TransportError> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|l| l.peripheral.clone())
            .ok_or(TransportError::NotConnected)
    }
}

impl BtleplugTransport {
    /// Discover services and start the event tasks on a connected peripheral.
    ///
    /// Nothing is spawned unless every fallible step succeeded.
    async fn open_link(
        &self,
        peripheral: &Peripheral,
        adapter: Adapter,
        device: &DeviceIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Vec<JoinHandle<()>>, TransportError> {
        // BlueZ reports the connection before its GATT cache is populated;
        // discovering too early returns an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(self.config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout("service discovery".into()))??;
        let mut notifications = peripheral.notifications().await?;
        let mut adapter_events = adapter.events().await?;
        info!("Connected and services discovered: {}", device.display_name());

        let mut tasks = Vec::with_capacity(2);

        // The adapter's DeviceDisconnected usually fires before the
        // notification stream closes.
        let disconnect_tx = events.clone();
        let peripheral_id = peripheral.id();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Disconnect watcher: device {id:?} disconnected.");
                        let _ = disconnect_tx.send(TransportEvent::Disconnected).await;
                        break;
                    }
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let event = TransportEvent::Notification {
                    characteristic: n.uuid,
                    value: n.value,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            info!("Notification stream ended – device disconnected.");
            let _ = events.send(TransportEvent::Disconnected).await;
        }));

        Ok(tasks)
    }
}

impl Default for BtleplugTransport {
    fn default() -> Self {
        Self::new(BtleplugConfig::default())
    }
}

async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(TransportError::Unavailable)?;

    // CoreBluetooth starts in an "unknown" state and silently ignores scans
    // issued before it reports PoweredOn.
    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => break,
                Ok(CentralState::PoweredOff) => return Err(TransportError::Unavailable),
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                    break;
                }
                Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(adapter)
}

async fn matching_identity(p: &Peripheral, filter: &DeviceFilter) -> Option<DeviceIdentity> {
    let props = p.properties().await.ok()??;
    let id = p.id().to_string();
    filter
        .matches(&id, props.local_name.as_deref(), &props.services)
        .then(|| DeviceIdentity::new(id, props.local_name))
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Characteristic = Characteristic;

    async fn select_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<DeviceIdentity, TransportError> {
        let adapter = first_adapter().await?;
        info!("Scanning for BITalino devices (timeout: {:?}) …", filter.scan_timeout);
        adapter.start_scan(ScanFilter::default()).await?;

        let search = async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if let Some(identity) = matching_identity(&p, filter).await {
                        return (identity, p);
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        let result = tokio::time::timeout(filter.scan_timeout, search).await;
        adapter.stop_scan().await.ok();

        let (identity, peripheral) = result.map_err(|_| {
            TransportError::NotFound(format!(
                "no BITalino device after {:?} of scanning",
                filter.scan_timeout
            ))
        })?;
        info!("Found device: {}", identity.display_name());
        self.remember(Found {
            identity: identity.clone(),
            peripheral,
            adapter,
        })
        .await;
        Ok(identity)
    }

    async fn connect(
        &self,
        device: &DeviceIdentity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let (peripheral, adapter) = {
            let list = self.found.lock().await;
            let f = list
                .iter()
                .find(|f| f.identity.id == device.id)
                .ok_or_else(|| TransportError::NotFound(device.id.clone()))?;
            (f.peripheral.clone(), f.adapter.clone())
        };

        match tokio::time::timeout(self.config.connect_timeout, peripheral.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                // The platform may still complete the attempt later.
                peripheral.disconnect().await.ok();
                return Err(TransportError::Timeout("BLE connect".into()));
            }
        }

        let tasks = match self.open_link(&peripheral, adapter, device, events).await {
            Ok(tasks) => tasks,
            Err(e) => {
                if let Err(de) = peripheral.disconnect().await {
                    warn!("disconnect after failed setup: {de}");
                }
                return Err(e);
            }
        };

        let previous = self.link.lock().await.replace(Link { peripheral, tasks });
        if let Some(old) = previous {
            warn!("connect: replacing a link that was never disconnected");
            for t in old.tasks {
                t.abort();
            }
        }
        Ok(())
    }

    async fn resolve(
        &self,
        service: Uuid,
        write: Uuid,
        notify: Uuid,
    ) -> Result<Session<Characteristic>, TransportError> {
        let peripheral = self.peripheral().await?;
        let services = peripheral.services();
        let svc = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| TransportError::NotFound(format!("service {service}")))?;

        let find_char = |uuid: Uuid| -> Result<Characteristic, TransportError> {
            svc.characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(format!("characteristic {uuid}")))
        };

        Ok(Session {
            service,
            write: find_char(write)?,
            notify: find_char(notify)?,
        })
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral().await?;
        debug!("write {} ← {payload:02x?}", characteristic.uuid);
        peripheral
            .write(characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), TransportError> {
        self.peripheral().await?.subscribe(characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<(), TransportError> {
        self.peripheral().await?.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        for t in link.tasks {
            t.abort();
        }
        link.peripheral.disconnect().await?;
        Ok(())
    }
}
