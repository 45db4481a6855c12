//! Device manager CLI configuration
//!
//! Configuration is read from a TOML file with a `[session]` table that maps
//! onto [`SessionConfig`] and a `[cli]` table for request defaults. Command
//! line flags override file values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devmgr_ble::{BleAddr, PeerSpec, SessionConfig};
use devmgr_core::{MgmtProto, TxOptions};

use crate::cli::Cli;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// BLE session configuration
    pub session: SessionConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,
}

/// Request defaults for CLI commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Response timeout for each request (in milliseconds)
    pub request_timeout_ms: u64,

    /// Attempts per request when responses time out
    pub request_tries: u32,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            request_tries: 1,
        }
    }
}

impl CliConfig {
    pub fn tx_options(&self) -> TxOptions {
        TxOptions::new()
            .with_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_tries(self.request_tries)
    }
}

// ----------------------------------------------------------------------------
// Loading and Overrides
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply command line overrides
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(peer) = &cli.peer {
            let address: BleAddr = peer
                .parse()
                .map_err(|e| CliError::InvalidArgument(format!("--peer: {}", e)))?;
            self.session.peer = PeerSpec::by_address(address);
        }
        if let Some(name) = &cli.name {
            self.session.peer.name = Some(name.clone());
        }
        if let Some(proto) = &cli.proto {
            self.session.mgmt_proto = parse_proto(proto)?;
        }
        if let Some(tries) = cli.conn_tries {
            self.session.conn_tries = tries;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.session
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;

        if self.session.peer.is_empty() {
            return Err(CliError::Config(
                "a peer address or name is required".to_string(),
            ));
        }
        if self.cli.request_timeout_ms == 0 {
            return Err(CliError::Config(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.cli.request_tries == 0 {
            return Err(CliError::Config(
                "request_tries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_proto(s: &str) -> Result<MgmtProto> {
    match s.to_ascii_lowercase().as_str() {
        "nmp" => Ok(MgmtProto::Nmp),
        "omp" => Ok(MgmtProto::Omp),
        other => Err(CliError::InvalidArgument(format!(
            "unknown management protocol '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Commands;

    fn create_test_cli() -> Cli {
        Cli {
            command: Commands::Probe,
            verbose: false,
            config: None,
            peer: None,
            name: None,
            proto: None,
            conn_tries: None,
        }
    }

    #[test]
    fn test_default_config_needs_a_peer() {
        let config = AppConfig::default();
        assert!(matches!(config.validate(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_parse_config_file() {
        let config = AppConfig::from_toml(
            r#"
            [session]
            mgmt_proto = "omp"
            conn_tries = 5
            write_rsp = true

            [session.peer]
            address = "c0:ff:ee:00:11:22"

            [cli]
            request_timeout_ms = 2500
            "#,
        )
        .unwrap();

        assert_eq!(config.session.mgmt_proto, MgmtProto::Omp);
        assert_eq!(config.session.conn_tries, 5);
        assert!(config.session.write_rsp);
        assert_eq!(
            config.session.peer.address.unwrap().to_string(),
            "c0:ff:ee:00:11:22"
        );
        assert_eq!(config.cli.request_timeout_ms, 2500);
        assert_eq!(config.cli.request_tries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = AppConfig::from_toml("[session]\nconn_tries = 5\n").unwrap();
        let cli = Cli {
            peer: Some("01:02:03:04:05:06".to_string()),
            proto: Some("OMP".to_string()),
            conn_tries: Some(2),
            ..create_test_cli()
        };

        config.apply_cli(&cli).unwrap();
        assert_eq!(config.session.conn_tries, 2);
        assert_eq!(config.session.mgmt_proto, MgmtProto::Omp);
        assert!(config.session.peer.address.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let mut config = AppConfig::default();
        let cli = Cli {
            peer: Some("not-an-address".to_string()),
            ..create_test_cli()
        };
        assert!(matches!(
            config.apply_cli(&cli),
            Err(CliError::InvalidArgument(_))
        ));

        let cli = Cli {
            proto: Some("smp".to_string()),
            ..create_test_cli()
        };
        assert!(config.apply_cli(&cli).is_err());
    }

    #[test]
    fn test_tx_options_from_cli_config() {
        let cli = CliConfig {
            request_timeout_ms: 500,
            request_tries: 3,
        };
        let opt = cli.tx_options();
        assert_eq!(opt.timeout, Duration::from_millis(500));
        assert_eq!(opt.tries, 3);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.session.peer = PeerSpec::by_name("sensor-1");
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }
}
