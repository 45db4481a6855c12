//! Connection contract
//!
//! A [`Connection`] is one link-layer BLE connection. The session builds a
//! fresh one through a [`Connector`] on every open attempt and never shares
//! it between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devmgr_core::LinkError;
use tokio::sync::{mpsc, oneshot};

use crate::config::{OwnAddrType, PeerSpec};
use crate::protocol::ChrId;

/// Link-layer connection handle
pub type ConnHandle = u16;

// ----------------------------------------------------------------------------
// Profile
// ----------------------------------------------------------------------------

/// Characteristic property bits, as advertised in the declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ChrProperties(pub u8);

impl ChrProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE_NO_RSP: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn contains(&self, bits: u8) -> bool {
        self.0 & bits == bits
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub id: ChrId,
    pub properties: ChrProperties,
    pub value_handle: u16,
}

impl Characteristic {
    /// Subscription bits the characteristic supports; zero when it cannot be
    /// subscribed to
    pub fn subscribe_type(&self) -> u8 {
        self.properties.0 & (ChrProperties::NOTIFY | ChrProperties::INDICATE)
    }
}

/// Discovered peer profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    chrs: Vec<Characteristic>,
}

impl Profile {
    pub fn new(chrs: Vec<Characteristic>) -> Self {
        Self { chrs }
    }

    pub fn find_chr(&self, id: &ChrId) -> Option<&Characteristic> {
        self.chrs.iter().find(|chr| &chr.id == id)
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.chrs
    }
}

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

/// Snapshot of the connection's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnDesc {
    pub conn_handle: Option<ConnHandle>,
    pub encrypted: bool,
    pub authenticated: bool,
    pub att_mtu: u16,
}

/// How a characteristic write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// One notification or indication from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub chr: ChrId,
    pub data: Vec<u8>,
    pub indication: bool,
}

/// Inbound conduit for one subscribed characteristic
///
/// `notifications` closing ends the listener, as does a value on `errors`.
pub struct NotifyListener {
    pub notifications: mpsc::Receiver<Notification>,
    pub errors: oneshot::Receiver<LinkError>,
}

/// Events for a link established outside the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification(Notification),
    MtuChanged(u16),
    EncryptionChanged { encrypted: bool, authenticated: bool },
    Disconnected(LinkError),
}

/// Event source handed to [`Connection::inherit`]
pub type LinkEvents = mpsc::Receiver<LinkEvent>;

// ----------------------------------------------------------------------------
// Contract
// ----------------------------------------------------------------------------

/// One BLE connection to a peer
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(
        &self,
        own_addr_type: OwnAddrType,
        peer: &PeerSpec,
        timeout: Duration,
    ) -> Result<(), LinkError>;

    /// Attach to a link someone else already established
    async fn inherit(&self, handle: ConnHandle, events: LinkEvents) -> Result<(), LinkError>;

    /// Negotiate the ATT MTU, returning the value in effect
    async fn exchange_mtu(&self) -> Result<u16, LinkError>;

    async fn discover_services(&self) -> Result<(), LinkError>;

    fn profile(&self) -> Profile;

    async fn subscribe(&self, chr: &Characteristic) -> Result<(), LinkError>;

    /// Start pairing and wait for it to finish
    async fn initiate_security(&self) -> Result<(), LinkError>;

    async fn write_chr(
        &self,
        chr: &Characteristic,
        data: &[u8],
        mode: WriteMode,
        label: &str,
    ) -> Result<(), LinkError>;

    async fn listen_for_notifications(
        &self,
        chr: &Characteristic,
    ) -> Result<NotifyListener, LinkError>;

    /// Resolves once, when the link goes down
    async fn disconnected(&self) -> LinkError;

    fn conn_info(&self) -> ConnDesc;

    fn att_mtu(&self) -> u16;

    fn conn_handle(&self) -> Option<ConnHandle>;

    /// Tear the connection down and release its background work
    async fn stop(&self);
}

/// Produces a fresh connection for each open attempt
pub trait Connector: Send + Sync {
    fn new_connection(&self) -> Arc<dyn Connection>;
}
