//! btleplug-backed connection
//!
//! Maps the [`Connection`] contract onto the host's BLE central stack.
//! Platform limitations:
//!
//! - The ATT MTU is negotiated by the OS. `exchange_mtu` only verifies the
//!   link is still up and reports the configured preferred MTU.
//! - There is no pairing API, so `initiate_security` is unsupported and the
//!   link reports itself unencrypted.
//! - Adopting a link established elsewhere is unsupported.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic as BtCharacteristic,
    Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use devmgr_core::{HostStatus, LinkError, BLE_ATT_MTU_DFLT};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{BleAddr, OwnAddrType, PeerSpec};
use crate::connection::{
    Characteristic, ChrProperties, ConnDesc, ConnHandle, Connection, Connector, LinkEvents,
    Notification, NotifyListener, Profile, WriteMode,
};
use crate::protocol::ChrId;

/// Buffered notifications per listener
const NOTIFY_CHANNEL_CAPACITY: usize = 32;

/// Interval between peripheral list checks while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ----------------------------------------------------------------------------
// Error Mapping
// ----------------------------------------------------------------------------

fn link_error(op: &str, err: btleplug::Error) -> LinkError {
    match err {
        btleplug::Error::NotConnected => LinkError::host(op, HostStatus::NotConnected),
        btleplug::Error::TimedOut(_) => LinkError::host(op, HostStatus::Timeout),
        btleplug::Error::DeviceNotFound => LinkError::PeerNotFound {
            peer: "device".to_string(),
        },
        other => LinkError::Other(format!("{} failed: {}", op, other)),
    }
}

fn chr_properties(flags: CharPropFlags) -> ChrProperties {
    let mut bits = 0;
    if flags.contains(CharPropFlags::READ) {
        bits |= ChrProperties::READ;
    }
    if flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        bits |= ChrProperties::WRITE_NO_RSP;
    }
    if flags.contains(CharPropFlags::WRITE) {
        bits |= ChrProperties::WRITE;
    }
    if flags.contains(CharPropFlags::NOTIFY) {
        bits |= ChrProperties::NOTIFY;
    }
    if flags.contains(CharPropFlags::INDICATE) {
        bits |= ChrProperties::INDICATE;
    }
    ChrProperties(bits)
}

fn to_bd_addr(addr: &BleAddr) -> BDAddr {
    BDAddr::from(addr.0)
}

/// btleplug does not expose the controller's handle; derive a stable
/// per-peer value from the address
fn conn_handle_for(address: Option<BDAddr>) -> Result<ConnHandle, LinkError> {
    let address = address
        .ok_or_else(|| LinkError::Other("peer address unavailable".to_string()))?
        .into_inner();
    Ok(u16::from_be_bytes([address[4], address[5]]))
}

/// Record the first disconnect cause; later ones are dropped
fn signal_disconnect(tx: &watch::Sender<Option<LinkError>>, cause: LinkError) {
    tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(cause);
        true
    });
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// Builds [`PlatformConnection`]s on one adapter
#[derive(Clone)]
pub struct PlatformConnector {
    adapter: Adapter,
    preferred_mtu: u16,
}

impl PlatformConnector {
    /// Use the first adapter the host reports
    pub async fn first_adapter(preferred_mtu: u16) -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Other(format!("Failed to create BLE manager: {}", e)))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Other(format!("Failed to get BLE adapters: {}", e)))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Other("No BLE adapters available".to_string()))?;

        info!("BLE adapter initialized");
        Ok(Self::new(adapter, preferred_mtu))
    }

    pub fn new(adapter: Adapter, preferred_mtu: u16) -> Self {
        Self {
            adapter,
            preferred_mtu,
        }
    }
}

impl Connector for PlatformConnector {
    fn new_connection(&self) -> Arc<dyn Connection> {
        Arc::new(PlatformConnection::new(
            self.adapter.clone(),
            self.preferred_mtu,
        ))
    }
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

#[derive(Default)]
struct LinkState {
    peripheral: Option<Peripheral>,
    profile: Profile,
    att_mtu: u16,
    conn_handle: Option<ConnHandle>,
}

/// One connection through btleplug
pub struct PlatformConnection {
    adapter: Adapter,
    preferred_mtu: u16,
    state: Mutex<LinkState>,
    disconnect: watch::Sender<Option<LinkError>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PlatformConnection {
    pub fn new(adapter: Adapter, preferred_mtu: u16) -> Self {
        let (disconnect, _) = watch::channel(None);
        Self {
            adapter,
            preferred_mtu,
            state: Mutex::new(LinkState {
                att_mtu: BLE_ATT_MTU_DFLT,
                ..LinkState::default()
            }),
            disconnect,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn peripheral(&self, op: &str) -> Result<Peripheral, LinkError> {
        self.state()
            .peripheral
            .clone()
            .ok_or_else(|| LinkError::host(op, HostStatus::NotConnected))
    }

    async fn matches(peripheral: &Peripheral, peer: &PeerSpec) -> bool {
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            _ => return false,
        };

        if let Some(addr) = &peer.address {
            return properties.address == to_bd_addr(addr);
        }
        match (&peer.name, &properties.local_name) {
            (Some(wanted), Some(name)) => wanted == name,
            _ => false,
        }
    }

    /// Scan until a peripheral matching `peer` shows up
    async fn find_peripheral(&self, peer: &PeerSpec) -> Result<Peripheral, LinkError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| link_error("start scan", e))?;

        let found = loop {
            let peripherals = self
                .adapter
                .peripherals()
                .await
                .map_err(|e| link_error("list peripherals", e))?;

            let mut found = None;
            for peripheral in peripherals {
                if Self::matches(&peripheral, peer).await {
                    found = Some(peripheral);
                    break;
                }
            }
            if let Some(peripheral) = found {
                break peripheral;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop BLE scan: {}", e);
        }
        Ok(found)
    }

    /// Watch adapter events for this peripheral going away
    async fn watch_disconnect(&self, peripheral: &Peripheral) -> Result<(), LinkError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| link_error("subscribe to adapter events", e))?;

        let id = peripheral.id();
        let cancel = self.cancel.clone();
        let disconnect = self.disconnect.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            signal_disconnect(&disconnect, LinkError::disconnected("peer disconnected"));
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    fn find_bt_chr(&self, peripheral: &Peripheral, chr: &Characteristic) -> Result<BtCharacteristic, LinkError> {
        let chrs: BTreeSet<BtCharacteristic> = peripheral.characteristics();
        chrs.into_iter()
            .find(|c| c.uuid == chr.id.chr_uuid && c.service_uuid == chr.id.svc_uuid)
            .ok_or_else(|| LinkError::Other(format!("characteristic {} not discovered", chr.id)))
    }
}

#[async_trait]
impl Connection for PlatformConnection {
    async fn connect(
        &self,
        own_addr_type: OwnAddrType,
        peer: &PeerSpec,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        if peer.is_empty() {
            return Err(LinkError::PeerNotFound {
                peer: peer.to_string(),
            });
        }
        debug!("Connecting to {} (own address type {:?})", peer, own_addr_type);

        let connect = async {
            let peripheral = self.find_peripheral(peer).await?;
            peripheral
                .connect()
                .await
                .map_err(|e| link_error("connect", e))?;
            Ok::<_, LinkError>(peripheral)
        };

        let peripheral = match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                if let Err(e) = self.adapter.stop_scan().await {
                    debug!("Failed to stop BLE scan: {}", e);
                }
                return Err(LinkError::ConnectTimeout { timeout });
            }
        };

        // Stored before anything else can fail so `stop` disconnects it
        self.state().peripheral = Some(peripheral.clone());
        self.watch_disconnect(&peripheral).await?;

        let properties = peripheral
            .properties()
            .await
            .map_err(|e| link_error("read peer address", e))?;
        let handle = conn_handle_for(properties.map(|p| p.address))?;

        self.state().conn_handle = Some(handle);
        info!("Connected to peer: {} (handle {})", peer, handle);
        Ok(())
    }

    async fn inherit(&self, handle: ConnHandle, _events: LinkEvents) -> Result<(), LinkError> {
        Err(LinkError::unsupported(format!(
            "adopting connection {} through btleplug",
            handle
        )))
    }

    async fn exchange_mtu(&self) -> Result<u16, LinkError> {
        let peripheral = self.peripheral("exchange MTU")?;
        let connected = peripheral
            .is_connected()
            .await
            .map_err(|e| link_error("exchange MTU", e))?;
        if !connected {
            return Err(LinkError::host("exchange MTU", HostStatus::NotConnected));
        }

        let mut state = self.state();
        state.att_mtu = self.preferred_mtu;
        Ok(state.att_mtu)
    }

    async fn discover_services(&self) -> Result<(), LinkError> {
        let peripheral = self.peripheral("discover services")?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| link_error("discover services", e))?;

        let chrs = peripheral
            .characteristics()
            .into_iter()
            .map(|c| Characteristic {
                id: ChrId::new(c.service_uuid, c.uuid),
                properties: chr_properties(c.properties),
                value_handle: 0,
            })
            .collect::<Vec<_>>();
        debug!("Discovered {} characteristics", chrs.len());

        self.state().profile = Profile::new(chrs);
        Ok(())
    }

    fn profile(&self) -> Profile {
        self.state().profile.clone()
    }

    async fn subscribe(&self, chr: &Characteristic) -> Result<(), LinkError> {
        let peripheral = self.peripheral("subscribe")?;
        let bt_chr = self.find_bt_chr(&peripheral, chr)?;
        peripheral
            .subscribe(&bt_chr)
            .await
            .map_err(|e| link_error("subscribe", e))
    }

    async fn initiate_security(&self) -> Result<(), LinkError> {
        Err(LinkError::unsupported("pairing through btleplug"))
    }

    async fn write_chr(
        &self,
        chr: &Characteristic,
        data: &[u8],
        mode: WriteMode,
        label: &str,
    ) -> Result<(), LinkError> {
        let peripheral = self.peripheral("write characteristic")?;
        let bt_chr = self.find_bt_chr(&peripheral, chr)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };

        peripheral
            .write(&bt_chr, data, write_type)
            .await
            .map_err(|e| link_error("write characteristic", e))?;
        debug!("Wrote {} request: {}", label, hex::encode(data));
        Ok(())
    }

    async fn listen_for_notifications(
        &self,
        chr: &Characteristic,
    ) -> Result<NotifyListener, LinkError> {
        let peripheral = self.peripheral("listen for notifications")?;
        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| link_error("listen for notifications", e))?;

        let (notify_tx, notifications) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let (error_tx, errors) = oneshot::channel();
        let chr_id = chr.id;
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    value = stream.next() => match value {
                        Some(value) if value.uuid == chr_id.chr_uuid => {
                            let notification = Notification {
                                chr: chr_id,
                                data: value.value,
                                indication: false,
                            };
                            if notify_tx.send(notification).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => {
                            let _ = error_tx.send(LinkError::disconnected("notification stream ended"));
                            break;
                        }
                    },
                }
            }
        });

        Ok(NotifyListener {
            notifications,
            errors,
        })
    }

    async fn disconnected(&self) -> LinkError {
        let mut rx = self.disconnect.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(cause) = current {
                return cause;
            }
            if rx.changed().await.is_err() {
                return LinkError::disconnected("connection dropped");
            }
        }
    }

    fn conn_info(&self) -> ConnDesc {
        let state = self.state();
        ConnDesc {
            conn_handle: state.conn_handle,
            encrypted: false,
            authenticated: false,
            att_mtu: state.att_mtu,
        }
    }

    fn att_mtu(&self) -> u16 {
        self.state().att_mtu
    }

    fn conn_handle(&self) -> Option<ConnHandle> {
        self.state().conn_handle
    }

    async fn stop(&self) {
        self.cancel.cancel();

        let peripheral = self.state().peripheral.take();
        if let Some(peripheral) = peripheral {
            match peripheral.is_connected().await {
                Ok(true) => {
                    if let Err(e) = peripheral.disconnect().await {
                        error!("Failed to disconnect from peer: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to query link state: {}", e),
            }
        }

        signal_disconnect(&self.disconnect, LinkError::disconnected("connection stopped"));
        self.tracker.close();
        self.tracker.wait().await;
    }
}
