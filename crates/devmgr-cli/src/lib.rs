//! Device manager CLI library
//!
//! Command-line front end that opens a BLE management session to one
//! device, sends requests, and prints what comes back.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use config::{AppConfig, CliConfig};
pub use error::{CliError, Result};
