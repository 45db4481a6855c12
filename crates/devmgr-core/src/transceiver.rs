//! Transceiver contract
//!
//! A transceiver matches outgoing requests to the responses that come back
//! as notifications. The session owns exactly one transceiver per open
//! attempt and drives it from two sides: request calls run on the session's
//! task queue, while notification listeners call the dispatch entry points
//! concurrently from their own tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::errors::{SessionError, SessionResult};
use crate::types::{CoapResponse, MgmtProto};

// ----------------------------------------------------------------------------
// Contract
// ----------------------------------------------------------------------------

/// Raw write function handed to the transceiver for one request
#[async_trait]
pub trait RawWrite: Send + Sync {
    async fn write_raw(&self, data: &[u8]) -> SessionResult<()>;
}

/// Parameters used to construct a transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransceiverParams {
    pub is_client: bool,
    pub mgmt_proto: MgmtProto,
    /// Message-level retries owned by the transceiver
    pub retries: u32,
}

/// Request/response matcher for the management and resource protocols
#[async_trait]
pub trait Transceiver: Send + Sync + 'static {
    type MgmtRequest: Clone + Send + Sync + 'static;
    type MgmtResponse: Send + 'static;
    type CoapRequest: Clone + Send + Sync + 'static;

    /// Send a management request and wait for its response
    async fn tx_mgmt(
        &self,
        writer: &dyn RawWrite,
        req: &Self::MgmtRequest,
        mtu: usize,
        timeout: Duration,
    ) -> SessionResult<Self::MgmtResponse>;

    /// Send a resource request and wait for its response
    async fn tx_coap(
        &self,
        writer: &dyn RawWrite,
        req: &Self::CoapRequest,
        mtu: usize,
        timeout: Duration,
    ) -> SessionResult<CoapResponse>;

    fn dispatch_mgmt_rsp(&self, data: &[u8]);

    fn dispatch_coap(&self, data: &[u8]);

    /// Abandon a partially received response
    fn abort_rx(&self, seq: u8) -> SessionResult<()>;

    /// Fail every pending caller with `cause`
    fn error_all(&self, cause: &SessionError);

    fn stop(&self);
}

/// Builds a fresh transceiver for every (re-)initialisation of a session
pub type TransceiverFactory<X> =
    Arc<dyn Fn(&TransceiverParams) -> SessionResult<X> + Send + Sync>;

// ----------------------------------------------------------------------------
// Raw Frame Transceiver
// ----------------------------------------------------------------------------

type PendingRx = oneshot::Sender<SessionResult<Vec<u8>>>;

/// Transceiver for pre-encoded management frames
///
/// Relies on the session running one request at a time: the next management
/// notification after a request is taken as its response. A request that
/// times out is written again, up to `retries` more times. Resource requests
/// need a codec and are rejected.
pub struct RawTransceiver {
    params: TransceiverParams,
    pending: Mutex<Option<PendingRx>>,
    stopped: AtomicBool,
}

impl RawTransceiver {
    pub fn new(params: &TransceiverParams) -> SessionResult<Self> {
        if !params.is_client {
            return Err(SessionError::unsupported("server-side raw transceiver"));
        }
        Ok(Self {
            params: *params,
            pending: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Factory suitable for a session builder
    pub fn factory() -> TransceiverFactory<Self> {
        Arc::new(RawTransceiver::new)
    }

    pub fn params(&self) -> &TransceiverParams {
        &self.params
    }

    fn take_pending(&self) -> Option<PendingRx> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Write one frame and wait for the next management response
    async fn tx_frame(
        &self,
        writer: &dyn RawWrite,
        req: &[u8],
        mtu: usize,
        timeout: Duration,
    ) -> SessionResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        for chunk in req.chunks(mtu) {
            if let Err(e) = writer.write_raw(chunk).await {
                self.take_pending();
                return Err(e);
            }
        }
        trace!("Wrote {} byte {} request", req.len(), self.params.mgmt_proto);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::TransceiverStopped),
            Err(_) => {
                self.take_pending();
                Err(SessionError::ResponseTimeout { timeout })
            }
        }
    }

    fn fail_pending(&self, err: SessionError) {
        if let Some(rx) = self.take_pending() {
            let _ = rx.send(Err(err));
        }
    }
}

#[async_trait]
impl Transceiver for RawTransceiver {
    type MgmtRequest = Vec<u8>;
    type MgmtResponse = Vec<u8>;
    type CoapRequest = Vec<u8>;

    async fn tx_mgmt(
        &self,
        writer: &dyn RawWrite,
        req: &Vec<u8>,
        mtu: usize,
        timeout: Duration,
    ) -> SessionResult<Vec<u8>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::TransceiverStopped);
        }
        if mtu == 0 {
            return Err(SessionError::transceiver("outbound MTU is zero"));
        }

        let attempts = self.params.retries + 1;
        for attempt in 1..=attempts {
            match self.tx_frame(writer, req, mtu, timeout).await {
                Err(SessionError::ResponseTimeout { .. }) if attempt < attempts => {
                    debug!(
                        "{} request timed out, resending (attempt {}/{})",
                        self.params.mgmt_proto, attempt, attempts
                    );
                }
                result => return result,
            }
        }
        Err(SessionError::ResponseTimeout { timeout })
    }

    async fn tx_coap(
        &self,
        _writer: &dyn RawWrite,
        _req: &Vec<u8>,
        _mtu: usize,
        _timeout: Duration,
    ) -> SessionResult<CoapResponse> {
        Err(SessionError::unsupported("resource requests over a raw transceiver"))
    }

    fn dispatch_mgmt_rsp(&self, data: &[u8]) {
        match self.take_pending() {
            Some(rx) => {
                let _ = rx.send(Ok(data.to_vec()));
            }
            None => debug!("Discarding unsolicited {} byte response", data.len()),
        }
    }

    fn dispatch_coap(&self, data: &[u8]) {
        // OMP management responses arrive on the unauthenticated resource channel
        if self.params.mgmt_proto == MgmtProto::Omp {
            self.dispatch_mgmt_rsp(data);
        } else {
            debug!("Discarding {} byte resource response", data.len());
        }
    }

    fn abort_rx(&self, seq: u8) -> SessionResult<()> {
        self.fail_pending(SessionError::RxAborted { seq });
        Ok(())
    }

    fn error_all(&self, cause: &SessionError) {
        self.fail_pending(cause.clone());
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.fail_pending(SessionError::TransceiverStopped);
    }
}
