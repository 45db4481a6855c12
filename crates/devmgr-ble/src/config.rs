//! BLE session configuration

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use devmgr_core::{MgmtProto, SessionError, SessionResult};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Addresses
// ----------------------------------------------------------------------------

/// 48-bit Bluetooth device address, written `aa:bb:cc:dd:ee:ff`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BleAddr(pub [u8; 6]);

impl FromStr for BleAddr {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| SessionError::config_error(format!("Invalid BLE address: {}", s)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| SessionError::config_error(format!("Invalid BLE address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(SessionError::config_error(format!("Invalid BLE address: {}", s)));
        }
        Ok(BleAddr(bytes))
    }
}

impl TryFrom<String> for BleAddr {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BleAddr> for String {
    fn from(addr: BleAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for BleAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

/// Address type we connect with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnAddrType {
    #[default]
    Random,
    Public,
    RpaPublicDefault,
    RpaRandomDefault,
}

/// Identifies the peer to connect to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSpec {
    pub address: Option<BleAddr>,
    /// Advertised local name, used when no address is given
    pub name: Option<String>,
}

impl PeerSpec {
    pub fn by_address(address: BleAddr) -> Self {
        Self {
            address: Some(address),
            name: None,
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            address: None,
            name: Some(name.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_none() && self.name.is_none()
    }
}

impl fmt::Display for PeerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.address, &self.name) {
            (Some(addr), _) => write!(f, "{}", addr),
            (None, Some(name)) => write!(f, "\"{}\"", name),
            (None, None) => write!(f, "<unspecified>"),
        }
    }
}

/// When the link is encrypted during open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptWhen {
    /// Only when a request needs it
    #[default]
    Never,
    /// Pair as part of every open
    Always,
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for a BLE management session, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub peer: PeerSpec,
    pub own_addr_type: OwnAddrType,
    pub mgmt_proto: MgmtProto,
    /// Open attempts before giving up
    pub conn_tries: u32,
    pub connect_timeout_ms: u64,
    pub encrypt_when: EncryptWhen,
    /// Write requests with response instead of without
    pub write_rsp: bool,
    pub queue_capacity: usize,
    pub txvr_retries: u32,
    /// ATT MTU requested during the exchange
    pub preferred_mtu: u16,
    /// Upper bound on the whole open sequence across attempts
    pub open_deadline_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer: PeerSpec::default(),
            own_addr_type: OwnAddrType::default(),
            mgmt_proto: MgmtProto::default(),
            conn_tries: 3,
            connect_timeout_ms: 10_000,
            encrypt_when: EncryptWhen::default(),
            write_rsp: false,
            queue_capacity: 10,
            txvr_retries: 3,
            preferred_mtu: 256,
            open_deadline_ms: None,
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl SessionConfig {
    pub fn new(peer: PeerSpec) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    /// Set management protocol
    pub fn with_mgmt_proto(mut self, proto: MgmtProto) -> Self {
        self.mgmt_proto = proto;
        self
    }

    /// Set number of open attempts
    pub fn with_conn_tries(mut self, tries: u32) -> Self {
        self.conn_tries = tries;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_encrypt_when(mut self, when: EncryptWhen) -> Self {
        self.encrypt_when = when;
        self
    }

    pub fn with_write_rsp(mut self, write_rsp: bool) -> Self {
        self.write_rsp = write_rsp;
        self
    }

    pub fn with_own_addr_type(mut self, addr_type: OwnAddrType) -> Self {
        self.own_addr_type = addr_type;
        self
    }

    pub fn with_open_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.open_deadline_ms = deadline.map(duration_ms);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn open_deadline(&self) -> Option<Duration> {
        self.open_deadline_ms.map(Duration::from_millis)
    }

    /// Validate configuration
    pub fn validate(&self) -> SessionResult<()> {
        if self.conn_tries == 0 {
            return Err(SessionError::config_error("conn_tries must be at least 1"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SessionError::config_error("connect_timeout_ms must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(SessionError::config_error("queue_capacity must be greater than 0"));
        }
        if self.preferred_mtu < devmgr_core::BLE_ATT_MTU_DFLT {
            return Err(SessionError::config_error(format!(
                "preferred_mtu must be at least {}",
                devmgr_core::BLE_ATT_MTU_DFLT
            )));
        }
        Ok(())
    }
}
