//! Device management session core
//!
//! Transport-neutral building blocks shared by management sessions: the
//! session error model, protocol vocabulary, the transceiver contract and the
//! serializing task queue every session-mutating operation runs on.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod errors;
pub mod task_queue;
pub mod transceiver;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use errors::{HostStatus, LinkError, SessionError, SessionResult};
pub use task_queue::TaskQueue;
pub use transceiver::{RawTransceiver, RawWrite, Transceiver, TransceiverFactory, TransceiverParams};
pub use types::{
    mtu_in, mtu_out, CoapCode, CoapResponse, MgmtProto, ResourceType, SecurityReqs, TxOptions,
    BLE_ATT_ATTR_MAX_LEN, BLE_ATT_MTU_DFLT, NOTIFY_CMD_BASE_SZ,
};
