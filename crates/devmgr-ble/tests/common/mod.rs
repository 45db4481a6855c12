//! Scripted connection and transceiver doubles for session tests
//!
//! A [`MockPlan`] is shared by every connection a [`MockConnector`] hands
//! out, so tests can script failures per attempt and inspect what each
//! attempt did.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devmgr_ble::{
    BleSession, Characteristic, ChrId, ChrProperties, ConnDesc, ConnHandle, Connection, Connector,
    LinkEvents, MgmtChrs, Notification, NotifyListener, OwnAddrType, PeerSpec, Profile,
    SessionConfig, SessionTable, WriteMode,
};
use devmgr_core::{
    CoapCode, CoapResponse, LinkError, MgmtProto, RawWrite, SessionError, SessionResult,
    Transceiver, TransceiverFactory, TransceiverParams,
};
use tokio::sync::{mpsc, oneshot, watch};

// ----------------------------------------------------------------------------
// Scripted Plan
// ----------------------------------------------------------------------------

/// Behaviour shared by all connections from one connector
#[derive(Default)]
pub struct MockPlan {
    /// Consumed one per connect; `Ok` once empty
    pub connect_results: Mutex<VecDeque<Result<(), LinkError>>>,
    /// Used once the scripted results run out
    pub connect_fallback: Mutex<Option<LinkError>>,
    /// Consumed one per MTU exchange; `Ok(256)` once empty
    pub mtu_results: Mutex<VecDeque<Result<u16, LinkError>>>,
    pub mtu_fallback: Mutex<Option<LinkError>>,
    /// Makes adopting an existing link fail
    pub inherit_failure: Mutex<Option<LinkError>>,
    pub connect_delay: Mutex<Option<Duration>>,
    pub profile: Mutex<Profile>,
    pub pairing_encrypts: AtomicBool,
    pub pairing_authenticates: AtomicBool,

    pub connect_attempts: AtomicUsize,
    pub pairing_attempts: AtomicUsize,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockPlan {
    pub fn for_proto(proto: MgmtProto) -> Arc<Self> {
        let plan = Self::default();
        *plan.profile.lock().unwrap() = full_profile(proto);
        Arc::new(plan)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn pairing_attempts(&self) -> usize {
        self.pairing_attempts.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Arc<MockConnection> {
        Arc::clone(self.connections.lock().unwrap().last().unwrap())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

/// Every characteristic the protocol uses, notifiable and writable
pub fn full_profile(proto: MgmtProto) -> Profile {
    let chrs = MgmtChrs::for_proto(proto);
    let mut ids: Vec<ChrId> = [
        chrs.nmp_req_chr,
        chrs.nmp_rsp_chr,
        chrs.res_public_req_chr,
        chrs.res_public_rsp_chr,
        chrs.res_unauth_req_chr,
        chrs.res_unauth_rsp_chr,
        chrs.res_secure_req_chr,
        chrs.res_secure_rsp_chr,
    ]
    .into_iter()
    .flatten()
    .collect();
    ids.sort();
    ids.dedup();

    Profile::new(
        ids.into_iter()
            .enumerate()
            .map(|(i, id)| Characteristic {
                id,
                properties: ChrProperties(
                    ChrProperties::WRITE | ChrProperties::WRITE_NO_RSP | ChrProperties::NOTIFY,
                ),
                value_handle: 0x10 + i as u16,
            })
            .collect(),
    )
}

// ----------------------------------------------------------------------------
// Mock Connection
// ----------------------------------------------------------------------------

struct NotifySink {
    chr: ChrId,
    tx: mpsc::Sender<Notification>,
    _error_tx: oneshot::Sender<LinkError>,
}

pub struct MockConnection {
    plan: Arc<MockPlan>,
    handle: Mutex<Option<ConnHandle>>,
    att_mtu: Mutex<u16>,
    encrypted: AtomicBool,
    authenticated: AtomicBool,
    disconnect: watch::Sender<Option<LinkError>>,
    sinks: Mutex<Vec<NotifySink>>,
    pub writes: Mutex<Vec<(ChrId, Vec<u8>, WriteMode)>>,
    pub subscriptions: Mutex<Vec<ChrId>>,
    pub stopped: AtomicBool,
    _events: Mutex<Option<LinkEvents>>,
}

impl MockConnection {
    fn new(plan: Arc<MockPlan>) -> Self {
        let (disconnect, _) = watch::channel(None);
        Self {
            plan,
            handle: Mutex::new(None),
            att_mtu: Mutex::new(devmgr_core::BLE_ATT_MTU_DFLT),
            encrypted: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            disconnect,
            sinks: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            _events: Mutex::new(None),
        }
    }

    /// Deliver a notification to every listener on `chr`
    pub async fn notify(&self, chr: ChrId, data: &[u8]) -> usize {
        let senders: Vec<_> = self
            .sinks
            .lock()
            .unwrap()
            .iter()
            .filter(|sink| sink.chr == chr)
            .map(|sink| sink.tx.clone())
            .collect();

        let mut delivered = 0;
        for tx in senders {
            let notification = Notification {
                chr,
                data: data.to_vec(),
                indication: false,
            };
            if tx.send(notification).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of listeners whose receiving side is still alive
    pub fn live_listeners(&self) -> usize {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .filter(|sink| !sink.tx.is_closed())
            .count()
    }

    pub fn listener_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn trigger_disconnect(&self, reason: &str) {
        self.disconnect
            .send_replace(Some(LinkError::disconnected(reason)));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(
        &self,
        _own_addr_type: OwnAddrType,
        _peer: &PeerSpec,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        let attempt = self.plan.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.plan.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.plan.connect_results.lock().unwrap().pop_front();
        let fallback = self.plan.connect_fallback.lock().unwrap().clone();
        match (scripted, fallback) {
            (Some(result), _) => result?,
            (None, Some(err)) => return Err(err),
            (None, None) => {}
        }

        *self.handle.lock().unwrap() = Some(attempt as ConnHandle);
        Ok(())
    }

    async fn inherit(&self, handle: ConnHandle, events: LinkEvents) -> Result<(), LinkError> {
        let failure = self.plan.inherit_failure.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        *self.handle.lock().unwrap() = Some(handle);
        *self._events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn exchange_mtu(&self) -> Result<u16, LinkError> {
        let scripted = self.plan.mtu_results.lock().unwrap().pop_front();
        let fallback = self.plan.mtu_fallback.lock().unwrap().clone();
        let mtu = match (scripted, fallback) {
            (Some(result), _) => result?,
            (None, Some(err)) => return Err(err),
            (None, None) => 256,
        };
        *self.att_mtu.lock().unwrap() = mtu;
        Ok(mtu)
    }

    async fn discover_services(&self) -> Result<(), LinkError> {
        Ok(())
    }

    fn profile(&self) -> Profile {
        self.plan.profile.lock().unwrap().clone()
    }

    async fn subscribe(&self, chr: &Characteristic) -> Result<(), LinkError> {
        self.subscriptions.lock().unwrap().push(chr.id);
        Ok(())
    }

    async fn initiate_security(&self) -> Result<(), LinkError> {
        self.plan.pairing_attempts.fetch_add(1, Ordering::SeqCst);
        if self.plan.pairing_encrypts.load(Ordering::SeqCst) {
            self.encrypted.store(true, Ordering::SeqCst);
        }
        if self.plan.pairing_authenticates.load(Ordering::SeqCst) {
            self.authenticated.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn write_chr(
        &self,
        chr: &Characteristic,
        data: &[u8],
        mode: WriteMode,
        _label: &str,
    ) -> Result<(), LinkError> {
        if self.is_stopped() {
            return Err(LinkError::disconnected("connection stopped"));
        }
        self.writes
            .lock()
            .unwrap()
            .push((chr.id, data.to_vec(), mode));
        Ok(())
    }

    async fn listen_for_notifications(
        &self,
        chr: &Characteristic,
    ) -> Result<NotifyListener, LinkError> {
        let (tx, notifications) = mpsc::channel(64);
        let (error_tx, errors) = oneshot::channel();
        self.sinks.lock().unwrap().push(NotifySink {
            chr: chr.id,
            tx,
            _error_tx: error_tx,
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
        ConnDesc {
            conn_handle: *self.handle.lock().unwrap(),
            encrypted: self.encrypted.load(Ordering::SeqCst),
            authenticated: self.authenticated.load(Ordering::SeqCst),
            att_mtu: *self.att_mtu.lock().unwrap(),
        }
    }

    fn att_mtu(&self) -> u16 {
        *self.att_mtu.lock().unwrap()
    }

    fn conn_handle(&self) -> Option<ConnHandle> {
        *self.handle.lock().unwrap()
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    plan: Arc<MockPlan>,
}

impl MockConnector {
    pub fn new(plan: Arc<MockPlan>) -> Arc<Self> {
        Arc::new(Self { plan })
    }
}

impl Connector for MockConnector {
    fn new_connection(&self) -> Arc<dyn Connection> {
        let conn = Arc::new(MockConnection::new(Arc::clone(&self.plan)));
        self.plan.connections.lock().unwrap().push(Arc::clone(&conn));
        conn
    }
}

// ----------------------------------------------------------------------------
// Mock Transceiver
// ----------------------------------------------------------------------------

/// Counters shared by every transceiver a factory builds
#[derive(Default)]
pub struct TxvrLog {
    pub built: AtomicUsize,
    pub mgmt_dispatches: AtomicUsize,
    pub coap_dispatches: AtomicUsize,
    pub tx_calls: AtomicUsize,
    /// Requests that time out before one is answered
    pub timeouts_left: AtomicUsize,
    pub aborted: Mutex<Vec<u8>>,
    pub error_all_causes: Mutex<Vec<SessionError>>,
    pub stops: AtomicUsize,
}

impl TxvrLog {
    pub fn mgmt_dispatches(&self) -> usize {
        self.mgmt_dispatches.load(Ordering::SeqCst)
    }

    pub fn coap_dispatches(&self) -> usize {
        self.coap_dispatches.load(Ordering::SeqCst)
    }

    pub fn tx_calls(&self) -> usize {
        self.tx_calls.load(Ordering::SeqCst)
    }
}

/// Echoes every request back as its response
pub struct MockTransceiver {
    log: Arc<TxvrLog>,
}

impl MockTransceiver {
    pub fn factory(log: Arc<TxvrLog>) -> TransceiverFactory<Self> {
        Arc::new(move |_params: &TransceiverParams| {
            log.built.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SessionError>(MockTransceiver {
                log: Arc::clone(&log),
            })
        })
    }

    fn take_timeout(&self) -> bool {
        self.log
            .timeouts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transceiver for MockTransceiver {
    type MgmtRequest = Vec<u8>;
    type MgmtResponse = Vec<u8>;
    type CoapRequest = Vec<u8>;

    async fn tx_mgmt(
        &self,
        writer: &dyn RawWrite,
        req: &Vec<u8>,
        _mtu: usize,
        timeout: Duration,
    ) -> SessionResult<Vec<u8>> {
        self.log.tx_calls.fetch_add(1, Ordering::SeqCst);
        writer.write_raw(req).await?;
        if self.take_timeout() {
            return Err(SessionError::ResponseTimeout { timeout });
        }
        Ok(req.clone())
    }

    async fn tx_coap(
        &self,
        writer: &dyn RawWrite,
        req: &Vec<u8>,
        _mtu: usize,
        timeout: Duration,
    ) -> SessionResult<CoapResponse> {
        self.log.tx_calls.fetch_add(1, Ordering::SeqCst);
        writer.write_raw(req).await?;
        if self.take_timeout() {
            return Err(SessionError::ResponseTimeout { timeout });
        }
        Ok(CoapResponse {
            code: CoapCode::CONTENT,
            payload: req.clone(),
        })
    }

    fn dispatch_mgmt_rsp(&self, _data: &[u8]) {
        self.log.mgmt_dispatches.fetch_add(1, Ordering::SeqCst);
    }

    fn dispatch_coap(&self, _data: &[u8]) {
        self.log.coap_dispatches.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_rx(&self, seq: u8) -> SessionResult<()> {
        self.log.aborted.lock().unwrap().push(seq);
        Ok(())
    }

    fn error_all(&self, cause: &SessionError) {
        self.log.error_all_causes.lock().unwrap().push(cause.clone());
    }

    fn stop(&self) {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Session Fixture
// ----------------------------------------------------------------------------

pub type TestSession = BleSession<MockTransceiver>;

pub struct Fixture {
    pub session: TestSession,
    pub plan: Arc<MockPlan>,
    pub log: Arc<TxvrLog>,
    pub registry: Arc<SessionTable<TestSession>>,
    pub closes: Arc<Mutex<Vec<SessionError>>>,
}

pub fn create_test_config(proto: MgmtProto) -> SessionConfig {
    SessionConfig::new(PeerSpec::by_name("test-device"))
        .with_mgmt_proto(proto)
        .with_connect_timeout(Duration::from_secs(1))
}

pub fn create_fixture(config: SessionConfig) -> Fixture {
    let plan = MockPlan::for_proto(config.mgmt_proto);
    create_fixture_with_plan(config, plan)
}

pub fn create_fixture_with_plan(config: SessionConfig, plan: Arc<MockPlan>) -> Fixture {
    let log = Arc::new(TxvrLog::default());
    let registry = Arc::new(SessionTable::new());
    let closes = Arc::new(Mutex::new(Vec::new()));

    let observed = Arc::clone(&closes);
    let session = BleSession::builder(config)
        .with_connector(MockConnector::new(Arc::clone(&plan)))
        .with_transceiver_factory(MockTransceiver::factory(Arc::clone(&log)))
        .with_registry(registry.clone())
        .with_observer(move |cause: &SessionError| observed.lock().unwrap().push(cause.clone()))
        .build()
        .unwrap();

    Fixture {
        session,
        plan,
        log,
        registry,
        closes,
    }
}

impl Fixture {
    pub fn close_count(&self) -> usize {
        self.closes.lock().unwrap().len()
    }
}

/// Poll `condition` until it holds or a second passes
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
