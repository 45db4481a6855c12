//! Shared protocol vocabulary: management protocol selection, resource types,
//! transmit options, CoAP response codes and MTU arithmetic

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Management Protocol
// ----------------------------------------------------------------------------

/// Management protocol carried over the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MgmtProto {
    /// Plain management protocol on a dedicated characteristic
    #[default]
    Nmp,
    /// Management protocol tunnelled through the OIC resource service
    Omp,
}

impl fmt::Display for MgmtProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MgmtProto::Nmp => write!(f, "nmp"),
            MgmtProto::Omp => write!(f, "omp"),
        }
    }
}

// ----------------------------------------------------------------------------
// Resource Types
// ----------------------------------------------------------------------------

/// Class of resource addressed by a CoAP-style request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Public,
    Unauth,
    Secure,
}

/// Link security a request needs before it may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityReqs {
    pub encryption: bool,
    pub authentication: bool,
}

impl ResourceType {
    pub fn security_reqs(&self) -> SecurityReqs {
        match self {
            ResourceType::Public => SecurityReqs::default(),
            ResourceType::Unauth => SecurityReqs {
                encryption: true,
                authentication: false,
            },
            ResourceType::Secure => SecurityReqs {
                encryption: true,
                authentication: true,
            },
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Public => write!(f, "public"),
            ResourceType::Unauth => write!(f, "unauth"),
            ResourceType::Secure => write!(f, "secure"),
        }
    }
}

// ----------------------------------------------------------------------------
// Transmit Options
// ----------------------------------------------------------------------------

/// Per-request transmit options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// Time to wait for the matching response
    pub timeout: Duration,
    /// Total number of attempts made by the retrying transmit helpers
    pub tries: u32,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            tries: 1,
        }
    }
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of attempts
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }
}

// ----------------------------------------------------------------------------
// CoAP Responses
// ----------------------------------------------------------------------------

/// CoAP response code, `class.detail` packed into one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoapCode(pub u8);

impl CoapCode {
    pub const CONTENT: CoapCode = CoapCode::new(2, 5);
    pub const CHANGED: CoapCode = CoapCode::new(2, 4);
    pub const NOT_FOUND: CoapCode = CoapCode::new(4, 4);
    pub const UNAUTHORIZED: CoapCode = CoapCode::new(4, 1);

    pub const fn new(class: u8, detail: u8) -> Self {
        CoapCode((class << 5) | (detail & 0x1f))
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Decoded response to a resource request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapResponse {
    pub code: CoapCode,
    pub payload: Vec<u8>,
}

// ----------------------------------------------------------------------------
// MTU Arithmetic
// ----------------------------------------------------------------------------

/// Bytes of every notification consumed by the ATT header
pub const NOTIFY_CMD_BASE_SZ: usize = 3;

/// Largest attribute value the ATT layer can carry
pub const BLE_ATT_ATTR_MAX_LEN: usize = 512;

/// ATT MTU in effect before any exchange
pub const BLE_ATT_MTU_DFLT: u16 = 23;

/// Largest payload the peer can notify us with for a given ATT MTU
pub fn mtu_in(att_mtu: u16) -> usize {
    usize::from(att_mtu).saturating_sub(NOTIFY_CMD_BASE_SZ)
}

/// Largest payload we write per request chunk for a given ATT MTU
pub fn mtu_out(att_mtu: u16) -> usize {
    mtu_in(att_mtu).min(BLE_ATT_ATTR_MAX_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu_out_is_bounded_by_attribute_length() {
        assert_eq!(mtu_in(BLE_ATT_MTU_DFLT), 20);
        assert_eq!(mtu_out(BLE_ATT_MTU_DFLT), 20);
        assert_eq!(mtu_out(256), 253);
        assert_eq!(mtu_out(515), 512);
        assert_eq!(mtu_out(1024), 512);
        assert_eq!(mtu_out(2), 0);
    }

    #[test]
    fn test_resource_security_requirements() {
        let secure = ResourceType::Secure.security_reqs();
        assert!(secure.encryption);
        assert!(secure.authentication);

        let unauth = ResourceType::Unauth.security_reqs();
        assert!(unauth.encryption);
        assert!(!unauth.authentication);

        assert_eq!(ResourceType::Public.security_reqs(), SecurityReqs::default());
    }

    #[test]
    fn test_coap_code_display() {
        assert_eq!(CoapCode::CONTENT.to_string(), "2.05");
        assert_eq!(CoapCode::NOT_FOUND.to_string(), "4.04");
        assert!(CoapCode::CHANGED.is_success());
        assert!(!CoapCode::UNAUTHORIZED.is_success());
    }
}
