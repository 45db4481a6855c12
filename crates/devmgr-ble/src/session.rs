//! BLE management session
//!
//! A [`BleSession`] manages one peer connection. Every operation that
//! touches the connection or the transceiver (each open attempt, every
//! transmit, aborts and shutdown) runs as a unit on the session's task
//! queue, so callers may use the session from any number of tasks.
//!
//! Each open attempt gets a fresh [`Link`]: a new connection, a new
//! transceiver, a cancellation token that stops the attempt's background
//! listeners and a task tracker that shutdown joins before returning.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use devmgr_core::{
    CoapResponse, LinkError, MgmtProto, RawWrite, ResourceType, SecurityReqs, SessionError,
    SessionResult, TaskQueue, Transceiver, TransceiverFactory, TransceiverParams, TxOptions,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{EncryptWhen, SessionConfig};
use crate::connection::{
    Characteristic, ConnDesc, ConnHandle, Connection, Connector, LinkEvents, NotifyListener,
    WriteMode,
};
use crate::lifecycle::{Lifecycle, Phase};
use crate::protocol::{ChrId, MgmtChrs};
use crate::registry::{SessionRegistry, SessionTable};

// ----------------------------------------------------------------------------
// Observer
// ----------------------------------------------------------------------------

/// Told when a fully open session closes
pub trait SessionObserver: Send + Sync {
    fn on_close(&self, cause: &SessionError);
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionError) + Send + Sync,
{
    fn on_close(&self, cause: &SessionError) {
        self(cause)
    }
}

// ----------------------------------------------------------------------------
// Per-Attempt State
// ----------------------------------------------------------------------------

/// Everything owned by one open attempt
struct Link<X> {
    conn: Arc<dyn Connection>,
    txvr: Arc<X>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<X> Link<X> {
    fn new(conn: Arc<dyn Connection>, txvr: X) -> Self {
        Self {
            conn,
            txvr: Arc::new(txvr),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

/// Why an open attempt failed, and whether another attempt may help
#[derive(Debug)]
struct OpenFailure {
    retry: bool,
    err: SessionError,
}

impl From<SessionError> for OpenFailure {
    fn from(err: SessionError) -> Self {
        Self { retry: false, err }
    }
}

impl From<LinkError> for OpenFailure {
    fn from(err: LinkError) -> Self {
        SessionError::from(err).into()
    }
}

/// Which transceiver entry point a notification listener feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Coap,
    Mgmt,
}

impl Dispatch {
    fn deliver<X: Transceiver>(self, txvr: &X, data: &[u8]) {
        match self {
            Dispatch::Coap => txvr.dispatch_coap(data),
            Dispatch::Mgmt => txvr.dispatch_mgmt_rsp(data),
        }
    }
}

/// Writes requests to one characteristic
struct ChrWriter {
    conn: Arc<dyn Connection>,
    chr: Characteristic,
    mode: WriteMode,
    label: &'static str,
}

#[async_trait]
impl RawWrite for ChrWriter {
    async fn write_raw(&self, data: &[u8]) -> SessionResult<()> {
        self.conn
            .write_chr(&self.chr, data, self.mode, self.label)
            .await
            .map_err(SessionError::from)
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

struct Inner<X: Transceiver> {
    config: SessionConfig,
    mgmt_chrs: MgmtChrs,
    connector: Arc<dyn Connector>,
    txvr_factory: TransceiverFactory<X>,
    registry: Arc<dyn SessionRegistry<BleSession<X>>>,
    observer: Option<Arc<dyn SessionObserver>>,
    lifecycle: Lifecycle,
    link: RwLock<Arc<Link<X>>>,
    queue: TaskQueue,
}

/// Management session to one BLE peer
pub struct BleSession<X: Transceiver> {
    inner: Arc<Inner<X>>,
}

impl<X: Transceiver> Clone for BleSession<X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<X: Transceiver> BleSession<X> {
    pub fn builder(config: SessionConfig) -> SessionBuilder<X> {
        SessionBuilder::new(config)
    }

    fn link(&self) -> Arc<Link<X>> {
        let link = self
            .inner
            .link
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&link)
    }

    fn txvr_params(config: &SessionConfig) -> TransceiverParams {
        TransceiverParams {
            is_client: true,
            mgmt_proto: config.mgmt_proto,
            retries: config.txvr_retries,
        }
    }

    /// Replace the link and restart the task queue for a new attempt
    async fn reinit(&self) -> SessionResult<Arc<Link<X>>> {
        let old = self.link();
        old.txvr.stop();

        let txvr = (self.inner.txvr_factory)(&Self::txvr_params(&self.inner.config))?;
        let link = Arc::new(Link::new(self.inner.connector.new_connection(), txvr));
        {
            let mut current = self
                .inner
                .link
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = Arc::clone(&link);
        }

        self.inner.queue.stop(SessionError::QueueStopped).await;
        self.inner.queue.start(self.inner.config.queue_capacity)?;
        Ok(link)
    }

    // ------------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------------

    /// Connect to the configured peer and open the session
    pub async fn open(&self) -> SessionResult<()> {
        self.inner.lifecycle.begin_open()?;

        let result = self.open_with_retries().await;
        if let Err(e) = &result {
            self.inner.lifecycle.abandon_open();
            warn!("Failed to open BLE session to {}: {}", self.inner.config.peer, e);
        }
        result
    }

    async fn open_with_retries(&self) -> SessionResult<()> {
        let started = Instant::now();
        let tries = self.inner.config.conn_tries.max(1);
        let deadline = self.inner.config.open_deadline();
        let mut last_err = None;

        for attempt in 1..=tries {
            if let Some(deadline) = deadline.filter(|_| attempt > 1) {
                if started.elapsed() >= deadline {
                    warn!(
                        "Open deadline of {:?} reached after {} attempts",
                        deadline,
                        attempt - 1
                    );
                    break;
                }
            }

            debug!(
                "Opening BLE session to {} (attempt {}/{})",
                self.inner.config.peer, attempt, tries
            );

            let link = self.reinit().await?;
            let session = self.clone();
            let outcome = self
                .inner
                .queue
                .run(async move { Ok::<_, SessionError>(session.open_once(link).await) })
                .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    info!(
                        "Opened BLE session to {} (mtu_out={})",
                        self.inner.config.peer,
                        self.mtu_out()
                    );
                    return Ok(());
                }
                Ok(Err(failure)) => failure,
                Err(err) => OpenFailure::from(err),
            };

            debug!("Open attempt {} failed: {}", attempt, failure.err);
            if let Err(e) = self.shutdown(failure.err.clone(), true).await {
                debug!("Teardown after failed open attempt: {}", e);
            }
            last_err = Some(failure.err);
            if !failure.retry {
                break;
            }
        }

        Err(last_err.unwrap_or(SessionError::AlreadyClosed))
    }

    /// One connection attempt; runs as a unit on the task queue
    async fn open_once(&self, link: Arc<Link<X>>) -> Result<(), OpenFailure> {
        let config = &self.inner.config;

        self.disconnect_listen(&link);

        link.conn
            .connect(config.own_addr_type, &config.peer, config.connect_timeout())
            .await?;

        match link.conn.exchange_mtu().await {
            Ok(mtu) => debug!("ATT MTU is {}", mtu),
            Err(e) => {
                return Err(OpenFailure {
                    retry: e.is_not_connected(),
                    err: e.into(),
                })
            }
        }

        link.conn.discover_services().await?;

        if let Ok(chr) = self.get_chr(&link, self.inner.mgmt_chrs.nmp_rsp_chr, "management response") {
            if chr.subscribe_type() != 0 {
                link.conn.subscribe(&chr).await?;
            }
        }

        if config.encrypt_when == EncryptWhen::Always {
            link.conn.initiate_security().await?;
        }

        self.notify_listen(&link).await;
        self.mark_open(&link);
        Ok(())
    }

    /// Open the session on a link established elsewhere
    pub async fn open_connected(&self, handle: ConnHandle, events: LinkEvents) -> SessionResult<()> {
        self.inner.lifecycle.begin_open()?;

        let result = self.adopt_connected(handle, events).await;
        if let Err(e) = &result {
            self.inner.lifecycle.abandon_open();
            warn!("Failed to adopt connection {}: {}", handle, e);
        }
        result
    }

    async fn adopt_connected(&self, handle: ConnHandle, events: LinkEvents) -> SessionResult<()> {
        let link = self.reinit().await?;
        let session = self.clone();
        let result = self
            .inner
            .queue
            .run(async move { session.adopt_once(link, handle, events).await })
            .await;

        if let Err(e) = &result {
            if let Err(teardown) = self.shutdown(e.clone(), true).await {
                debug!("Teardown after failed adoption: {}", teardown);
            }
        }
        result
    }

    async fn adopt_once(
        &self,
        link: Arc<Link<X>>,
        handle: ConnHandle,
        events: LinkEvents,
    ) -> SessionResult<()> {
        link.conn.inherit(handle, events).await?;
        self.disconnect_listen(&link);
        self.notify_listen(&link).await;
        self.mark_open(&link);
        info!("Adopted connection {} for BLE session", handle);
        Ok(())
    }

    /// Register with the transport and flip to `Open`. Runs inside the unit
    /// that opened the link, so no queued shutdown can overtake it.
    fn mark_open(&self, link: &Link<X>) {
        match link.conn.conn_handle() {
            Some(handle) => self.inner.registry.add_session(handle, self.clone()),
            None => warn!("Opened session has no connection handle"),
        }
        self.inner.lifecycle.complete_open();
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Tear down the current link
    ///
    /// `allow_opening` lets the open path clean up its own failed attempt;
    /// all other callers may only shut down an open session.
    async fn shutdown(&self, cause: SessionError, allow_opening: bool) -> SessionResult<()> {
        let ticket = self.inner.lifecycle.begin_shutdown(allow_opening)?;
        let link = self.link();
        debug!("Shutting down BLE session: {}", cause);

        self.inner.queue.stop_no_wait(cause.clone());
        link.conn.stop().await;
        if ticket.was_open {
            if let Some(handle) = link.conn.conn_handle() {
                self.inner.registry.remove_session(handle);
            }
        }

        link.txvr.error_all(&cause);
        link.txvr.stop();

        link.cancel.cancel();
        link.tracker.close();
        link.tracker.wait().await;

        if self.inner.lifecycle.finish_shutdown() {
            info!("BLE session to {} closed: {}", self.inner.config.peer, cause);
            if let Some(observer) = &self.inner.observer {
                observer.on_close(&cause);
            }
        }
        Ok(())
    }

    /// Close an open session
    pub async fn close(&self) -> SessionResult<()> {
        if self.inner.lifecycle.phase() == Phase::Closed {
            return Err(SessionError::AlreadyClosed);
        }

        let session = self.clone();
        self.inner
            .queue
            .run(async move { session.shutdown(SessionError::ManuallyClosed, false).await })
            .await
    }

    // ------------------------------------------------------------------------
    // Background Listeners
    // ------------------------------------------------------------------------

    fn disconnect_listen(&self, link: &Link<X>) {
        let conn = Arc::clone(&link.conn);
        let cancel = link.cancel.clone();
        let session = self.clone();

        link.tracker.spawn(async move {
            let cause = tokio::select! {
                _ = cancel.cancelled() => return,
                cause = conn.disconnected() => cause,
            };
            info!("BLE peer disconnected: {}", cause);

            let closer = session.clone();
            let shutdown = async move { closer.shutdown(SessionError::Link(cause), false).await };
            tokio::select! {
                _ = cancel.cancelled() => {}
                queued = session.inner.queue.enqueue(shutdown) => {
                    if let Err(e) = queued {
                        debug!("Could not queue shutdown after disconnect: {}", e);
                    }
                }
            }
        });
    }

    async fn notify_listen(&self, link: &Link<X>) {
        let chrs = &self.inner.mgmt_chrs;
        let listeners = [
            (chrs.res_unauth_rsp_chr, Dispatch::Coap, "unauth resource response"),
            (chrs.res_secure_rsp_chr, Dispatch::Coap, "secure resource response"),
            (chrs.res_public_rsp_chr, Dispatch::Coap, "public resource response"),
            (chrs.nmp_rsp_chr, Dispatch::Mgmt, "management response"),
        ];

        // One listener per characteristic; in OMP the management response
        // shares the unauthenticated resource channel, whose listener wins.
        let mut listening: Vec<ChrId> = Vec::with_capacity(listeners.len());
        for (chr_id, dispatch, name) in listeners {
            if let Some(id) = chr_id {
                if listening.contains(&id) {
                    debug!(
                        "error listening for notifications: {} already has a listener",
                        id
                    );
                    continue;
                }
            }
            if self.notify_listen_once(link, chr_id, dispatch, name).await {
                listening.extend(chr_id);
            }
        }
    }

    async fn notify_listen_once(
        &self,
        link: &Link<X>,
        chr_id: Option<ChrId>,
        dispatch: Dispatch,
        name: &str,
    ) -> bool {
        let listener = match self.create_notify_listener(link, chr_id, name).await {
            Ok(listener) => listener,
            Err(e) => {
                debug!("error listening for notifications: {}", e);
                return false;
            }
        };

        let txvr = Arc::clone(&link.txvr);
        let cancel = link.cancel.clone();
        link.tracker.spawn(async move {
            let NotifyListener {
                mut notifications,
                mut errors,
            } = listener;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    err = &mut errors => {
                        if let Ok(err) = err {
                            debug!("Notification listener failed: {}", err);
                        }
                        break;
                    }
                    item = notifications.recv() => match item {
                        Some(notification) => dispatch.deliver(txvr.as_ref(), &notification.data),
                        None => break,
                    },
                }
            }
        });
        true
    }

    async fn create_notify_listener(
        &self,
        link: &Link<X>,
        chr_id: Option<ChrId>,
        name: &str,
    ) -> SessionResult<NotifyListener> {
        let chr = self.get_chr(link, chr_id, name)?;
        Ok(link.conn.listen_for_notifications(&chr).await?)
    }

    // ------------------------------------------------------------------------
    // Characteristics and Security
    // ------------------------------------------------------------------------

    fn get_chr(
        &self,
        link: &Link<X>,
        chr_id: Option<ChrId>,
        name: &str,
    ) -> SessionResult<Characteristic> {
        let chr_id = chr_id.ok_or_else(|| SessionError::MissingCharacteristic {
            name: name.to_string(),
        })?;

        link.conn
            .profile()
            .find_chr(&chr_id)
            .cloned()
            .ok_or_else(|| SessionError::UnsupportedCharacteristic {
                chr: chr_id.to_string(),
            })
    }

    fn check_security(desc: &ConnDesc, reqs: SecurityReqs) -> (bool, bool) {
        (
            !reqs.encryption || desc.encrypted,
            !reqs.authentication || desc.authenticated,
        )
    }

    /// Pair at most once to meet `reqs`
    async fn ensure_security(&self, link: &Link<X>, reqs: SecurityReqs) -> SessionResult<()> {
        let (enc_good, auth_good) = Self::check_security(&link.conn.conn_info(), reqs);
        if enc_good && auth_good {
            return Ok(());
        }

        debug!("Link security insufficient, initiating pairing");
        link.conn.initiate_security().await?;

        let (enc_good, auth_good) = Self::check_security(&link.conn.conn_info(), reqs);
        if !enc_good {
            return Err(SessionError::InsufficientEncryption);
        }
        if !auth_good {
            return Err(SessionError::InsufficientAuthentication);
        }
        Ok(())
    }

    fn writer(&self, link: &Link<X>, chr: Characteristic, label: &'static str) -> ChrWriter {
        let mode = if self.inner.config.write_rsp {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        };
        ChrWriter {
            conn: Arc::clone(&link.conn),
            chr,
            mode,
            label,
        }
    }

    // ------------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------------

    /// Send one management request
    pub async fn tx_mgmt_once(
        &self,
        req: X::MgmtRequest,
        opt: &TxOptions,
    ) -> SessionResult<X::MgmtResponse> {
        let session = self.clone();
        let timeout = opt.timeout;
        self.inner
            .queue
            .run(async move { session.tx_mgmt_unit(req, timeout).await })
            .await
    }

    async fn tx_mgmt_unit(
        &self,
        req: X::MgmtRequest,
        timeout: Duration,
    ) -> SessionResult<X::MgmtResponse> {
        let link = self.link();
        let chr = self.get_chr(&link, self.inner.mgmt_chrs.nmp_req_chr, "management request")?;
        let writer = self.writer(&link, chr, "nmp");
        let mtu = devmgr_core::mtu_out(link.conn.att_mtu());
        link.txvr.tx_mgmt(&writer, &req, mtu, timeout).await
    }

    /// Send one resource request, pairing first if the resource needs it
    pub async fn tx_coap_once(
        &self,
        req: X::CoapRequest,
        res_type: ResourceType,
        opt: &TxOptions,
    ) -> SessionResult<CoapResponse> {
        let session = self.clone();
        let timeout = opt.timeout;
        self.inner
            .queue
            .run(async move { session.tx_coap_unit(req, res_type, timeout).await })
            .await
    }

    async fn tx_coap_unit(
        &self,
        req: X::CoapRequest,
        res_type: ResourceType,
        timeout: Duration,
    ) -> SessionResult<CoapResponse> {
        let link = self.link();
        let chr_id = self.inner.mgmt_chrs.res_req_chr(res_type);
        let chr = self.get_chr(&link, chr_id, "resource request")?;
        self.ensure_security(&link, res_type.security_reqs()).await?;

        let writer = self.writer(&link, chr, "coap");
        let mtu = devmgr_core::mtu_out(link.conn.att_mtu());
        link.txvr.tx_coap(&writer, &req, mtu, timeout).await
    }

    /// Send a management request, retrying timeouts up to `opt.tries` times
    pub async fn tx_mgmt(
        &self,
        req: &X::MgmtRequest,
        opt: &TxOptions,
    ) -> SessionResult<X::MgmtResponse> {
        let tries = opt.tries.max(1);
        let mut attempt = 1;
        loop {
            match self.tx_mgmt_once(req.clone(), opt).await {
                Err(e) if e.is_timeout() && attempt < tries => {
                    debug!("Management request timed out (attempt {}/{})", attempt, tries);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Send a resource request, retrying timeouts up to `opt.tries` times
    pub async fn tx_coap(
        &self,
        req: &X::CoapRequest,
        res_type: ResourceType,
        opt: &TxOptions,
    ) -> SessionResult<CoapResponse> {
        let tries = opt.tries.max(1);
        let mut attempt = 1;
        loop {
            match self.tx_coap_once(req.clone(), res_type, opt).await {
                Err(e) if e.is_timeout() && attempt < tries => {
                    debug!("Resource request timed out (attempt {}/{})", attempt, tries);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Abandon a partially received response
    pub async fn abort_rx(&self, seq: u8) -> SessionResult<()> {
        let session = self.clone();
        self.inner
            .queue
            .run(async move { session.link().txvr.abort_rx(seq) })
            .await
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn is_open(&self) -> bool {
        self.inner.lifecycle.is_open()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lifecycle.phase()
    }

    pub fn mtu_in(&self) -> usize {
        devmgr_core::mtu_in(self.link().conn.att_mtu())
    }

    pub fn mtu_out(&self) -> usize {
        devmgr_core::mtu_out(self.link().conn.att_mtu())
    }

    pub fn conn_info(&self) -> ConnDesc {
        self.link().conn.conn_info()
    }

    pub fn mgmt_proto(&self) -> MgmtProto {
        self.inner.config.mgmt_proto
    }

    /// Resource messages use the stream (TCP-style) CoAP framing over BLE
    pub fn coap_is_tcp(&self) -> bool {
        true
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Assembles a [`BleSession`]
pub struct SessionBuilder<X: Transceiver> {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    txvr_factory: Option<TransceiverFactory<X>>,
    registry: Option<Arc<dyn SessionRegistry<BleSession<X>>>>,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl<X: Transceiver> SessionBuilder<X> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: None,
            txvr_factory: None,
            registry: None,
            observer: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_transceiver_factory(mut self, factory: TransceiverFactory<X>) -> Self {
        self.txvr_factory = Some(factory);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn SessionRegistry<BleSession<X>>>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_observer<O: SessionObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> SessionResult<BleSession<X>> {
        self.config.validate()?;

        let connector = self
            .connector
            .ok_or_else(|| SessionError::config_error("session requires a connector"))?;
        let txvr_factory = self
            .txvr_factory
            .ok_or_else(|| SessionError::config_error("session requires a transceiver factory"))?;
        let registry: Arc<dyn SessionRegistry<BleSession<X>>> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(SessionTable::new()),
        };

        let txvr = txvr_factory(&BleSession::<X>::txvr_params(&self.config))?;
        let link = Link::new(connector.new_connection(), txvr);

        let mgmt_chrs = MgmtChrs::for_proto(self.config.mgmt_proto);
        Ok(BleSession {
            inner: Arc::new(Inner {
                config: self.config,
                mgmt_chrs,
                connector,
                txvr_factory,
                registry,
                observer: self.observer,
                lifecycle: Lifecycle::new(),
                link: RwLock::new(Arc::new(link)),
                queue: TaskQueue::new(),
            }),
        })
    }
}
