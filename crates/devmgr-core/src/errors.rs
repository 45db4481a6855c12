//! Error types for device management sessions
//!
//! `SessionError` is the single error surfaced by every public session
//! operation. It is `Clone` because one shutdown cause is delivered to every
//! caller parked on the session when it goes down: pending transceiver
//! requests, discarded task-queue units and the on-close observer.

use core::fmt;
use std::time::Duration;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Host Status
// ----------------------------------------------------------------------------

/// Status code reported by the BLE host for a failed link procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStatus {
    /// The connection went away underneath the procedure (`ENOTCONN`)
    NotConnected,
    /// The controller did not answer in time (`ETIMEOUT`)
    Timeout,
    /// Another procedure is already in progress (`EBUSY`)
    Busy,
    Other(u16),
}

impl HostStatus {
    pub const NOT_CONNECTED_CODE: u16 = 7;
    pub const TIMEOUT_CODE: u16 = 13;
    pub const BUSY_CODE: u16 = 15;

    /// Classify a raw host status code
    pub fn from_code(code: u16) -> Self {
        match code {
            Self::NOT_CONNECTED_CODE => HostStatus::NotConnected,
            Self::TIMEOUT_CODE => HostStatus::Timeout,
            Self::BUSY_CODE => HostStatus::Busy,
            other => HostStatus::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            HostStatus::NotConnected => Self::NOT_CONNECTED_CODE,
            HostStatus::Timeout => Self::TIMEOUT_CODE,
            HostStatus::Busy => Self::BUSY_CODE,
            HostStatus::Other(code) => *code,
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostStatus::NotConnected => "not connected",
            HostStatus::Timeout => "timeout",
            HostStatus::Busy => "busy",
            HostStatus::Other(_) => "error",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

// ----------------------------------------------------------------------------
// Link Errors
// ----------------------------------------------------------------------------

/// Failures reported by the link layer (connect, MTU exchange, discovery,
/// subscribe, pairing, writes)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("{op} failed: host status {status}")]
    Host { op: String, status: HostStatus },

    #[error("Connection attempt timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    #[error("Peer disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Link does not support {op}")]
    Unsupported { op: String },

    #[error("Link error: {0}")]
    Other(String),
}

impl LinkError {
    /// Create a host-status error for the named procedure
    pub fn host(op: impl Into<String>, status: HostStatus) -> Self {
        Self::Host {
            op: op.into(),
            status,
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported { op: op.into() }
    }

    /// The host reports that no connection exists. This is the only failure
    /// an open attempt treats as retryable.
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            LinkError::Host {
                status: HostStatus::NotConnected,
                ..
            }
        )
    }
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Errors returned by session, transceiver and task-queue operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Attempt to open an already-open BLE session")]
    AlreadyOpen,

    #[error("Attempt to close an already-closed session")]
    AlreadyClosed,

    #[error("BLE session not configured with required characteristic: {name}")]
    MissingCharacteristic { name: String },

    #[error("BLE peer doesn't support required characteristic: {chr}")]
    UnsupportedCharacteristic { chr: String },

    #[error("Insufficient BLE security; characteristic requires encryption")]
    InsufficientEncryption,

    #[error("Insufficient BLE security; characteristic requires authentication")]
    InsufficientAuthentication,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Response timeout after {timeout:?}")]
    ResponseTimeout { timeout: Duration },

    #[error("Receive aborted (seq={seq})")]
    RxAborted { seq: u8 },

    #[error("Transceiver stopped")]
    TransceiverStopped,

    #[error("Transceiver error: {reason}")]
    Transceiver { reason: String },

    #[error("Task queue is not running")]
    QueueStopped,

    #[error("Task queue is already running")]
    QueueAlreadyRunning,

    #[error("BLE session manually closed")]
    ManuallyClosed,

    #[error("Operation not supported: {op}")]
    Unsupported { op: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },
}

impl SessionError {
    /// Create a configuration error
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transceiver error
    pub fn transceiver(reason: impl Into<String>) -> Self {
        Self::Transceiver {
            reason: reason.into(),
        }
    }

    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported { op: op.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::ResponseTimeout { .. })
    }

    /// The underlying link failure, if this error came from the link layer
    pub fn as_link(&self) -> Option<&LinkError> {
        match self {
            SessionError::Link(err) => Some(err),
            _ => None,
        }
    }
}

pub type SessionResult<T> = core::result::Result<T, SessionError>;
