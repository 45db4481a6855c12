//! Command handlers for the device manager CLI

use std::sync::Arc;

use tracing::{info, warn};

use devmgr_ble::{BleSession, PlatformConnector};
use devmgr_core::{RawTransceiver, SessionError, TxOptions};

use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::Result;

type CliSession = BleSession<RawTransceiver>;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, config: AppConfig) -> Result<()> {
        match command {
            Commands::Probe => Self::handle_probe_command(config).await,
            Commands::Send {
                request,
                timeout_ms,
                tries,
            } => Self::handle_send_command(config, request, timeout_ms, tries).await,
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Open a session and report the negotiated link
    async fn handle_probe_command(config: AppConfig) -> Result<()> {
        let session = Self::open_session(&config).await?;

        let info = session.conn_info();
        println!("peer:       {}", config.session.peer);
        println!("protocol:   {}", session.mgmt_proto());
        match info.conn_handle {
            Some(handle) => println!("handle:     {}", handle),
            None => println!("handle:     -"),
        }
        println!("att mtu:    {}", info.att_mtu);
        println!("mtu in/out: {}/{}", session.mtu_in(), session.mtu_out());
        println!("encrypted:  {}", info.encrypted);

        Self::close_session(&session).await
    }

    /// Send one raw management request
    async fn handle_send_command(
        config: AppConfig,
        request: String,
        timeout_ms: Option<u64>,
        tries: Option<u32>,
    ) -> Result<()> {
        let req = hex::decode(request.trim())?;
        let opt = Self::request_options(&config, timeout_ms, tries);

        let session = Self::open_session(&config).await?;
        let result = session.tx_mgmt(&req, &opt).await;
        let closed = Self::close_session(&session).await;

        let rsp = result?;
        println!("{}", hex::encode(&rsp));
        closed
    }

    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }

    fn request_options(config: &AppConfig, timeout_ms: Option<u64>, tries: Option<u32>) -> TxOptions {
        let mut opt = config.cli.tx_options();
        if let Some(ms) = timeout_ms {
            opt = opt.with_timeout(std::time::Duration::from_millis(ms));
        }
        if let Some(tries) = tries {
            opt = opt.with_tries(tries);
        }
        opt
    }

    async fn open_session(config: &AppConfig) -> Result<CliSession> {
        config.validate()?;
        let connector = PlatformConnector::first_adapter(config.session.preferred_mtu).await?;

        let session: CliSession = BleSession::builder(config.session.clone())
            .with_connector(Arc::new(connector))
            .with_transceiver_factory(RawTransceiver::factory())
            .with_observer(|cause: &SessionError| {
                if *cause != SessionError::ManuallyClosed {
                    warn!("Session closed unexpectedly: {}", cause);
                }
            })
            .build()?;

        info!("Connecting to {}...", config.session.peer);
        session.open().await?;
        Ok(session)
    }

    async fn close_session(session: &CliSession) -> Result<()> {
        match session.close().await {
            Ok(()) | Err(SessionError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
