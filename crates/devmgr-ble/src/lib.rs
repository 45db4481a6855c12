//! Bluetooth Low Energy management session
//!
//! This crate manages one management session to an embedded device over a
//! BLE link that carries a management protocol and a CoAP-style resource
//! protocol on GATT characteristics.
//!
//! ## Architecture
//!
//! - [`config`] - Session configuration
//! - [`protocol`] - Service and characteristic catalogue
//! - [`connection`] - The connection contract a session drives
//! - [`lifecycle`] - Closed/opening/open/shutting-down state machine
//! - [`registry`] - Transport-side table of open sessions
//! - [`session`] - The session: open with retries, listeners, security,
//!   transmit and shutdown
//! - [`platform`] - btleplug implementation of the connection contract
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devmgr_ble::{BleSession, PeerSpec, PlatformConnector, SessionConfig};
//! use devmgr_core::{RawTransceiver, TxOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new(PeerSpec::by_name("my-device"));
//! let connector = PlatformConnector::first_adapter(config.preferred_mtu).await?;
//!
//! let session: BleSession<RawTransceiver> = BleSession::builder(config)
//!     .with_connector(Arc::new(connector))
//!     .with_transceiver_factory(RawTransceiver::factory())
//!     .with_observer(|cause: &devmgr_core::SessionError| println!("closed: {}", cause))
//!     .build()?;
//!
//! session.open().await?;
//! let rsp = session.tx_mgmt(&vec![0x00, 0x00, 0x00, 0x00], &TxOptions::new()).await?;
//! println!("{} byte response", rsp.len());
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod lifecycle;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod session;

// Public API exports
pub use config::{BleAddr, EncryptWhen, OwnAddrType, PeerSpec, SessionConfig};
pub use connection::{
    Characteristic, ChrProperties, ConnDesc, ConnHandle, Connection, Connector, LinkEvent,
    LinkEvents, Notification, NotifyListener, Profile, WriteMode,
};
pub use lifecycle::Phase;
pub use platform::{PlatformConnection, PlatformConnector};
pub use protocol::{ChrId, MgmtChrs};
pub use registry::{SessionRegistry, SessionTable};
pub use session::{BleSession, SessionBuilder, SessionObserver};
