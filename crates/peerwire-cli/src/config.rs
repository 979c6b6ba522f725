//! peerwire CLI configuration
//!
//! Settings are layered with increasing priority:
//! - defaults
//! - a TOML file given with `--config`
//! - `PEERWIRE_*` environment variables
//! - command line flags

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use peerwire_ble::BleConfig;
use peerwire_tcp::TcpConfig;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

pub const ENV_NAME: &str = "PEERWIRE_NAME";
pub const ENV_CODEC: &str = "PEERWIRE_CODEC";
pub const ENV_BIND_ADDR: &str = "PEERWIRE_BIND_ADDR";
pub const ENV_MAX_FRAME_LEN: &str = "PEERWIRE_MAX_FRAME_LEN";
pub const ENV_BLE_CHUNK_SIZE: &str = "PEERWIRE_BLE_CHUNK_SIZE";
pub const ENV_BLE_DEVICE_PREFIX: &str = "PEERWIRE_BLE_DEVICE_PREFIX";
pub const ENV_BLE_SCAN_TIMEOUT_SECS: &str = "PEERWIRE_BLE_SCAN_TIMEOUT_SECS";

// ----------------------------------------------------------------------------
// Codec Selection
// ----------------------------------------------------------------------------

/// Payload codec used for application envelopes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

impl FromStr for CodecKind {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Ok(CodecKind::Bincode),
            "json" => Ok(CodecKind::Json),
            other => Err(CliError::Config(format!("unknown codec {:?}", other))),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Bincode => write!(f, "bincode"),
            CodecKind::Json => write!(f, "json"),
        }
    }
}

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of the `peerwire` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logical name sent in the identification handshake
    pub name: String,
    pub codec: CodecKind,
    pub tcp: TcpConfig,
    pub ble: BleConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "peerwire".to_string(),
            codec: CodecKind::default(),
            tcp: TcpConfig::default(),
            ble: BleConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the configuration for one invocation
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.apply_cli(cli)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `PEERWIRE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_NAME) {
            self.name = name;
        }
        if let Some(value) = lookup(ENV_CODEC) {
            self.codec = parse_env(ENV_CODEC, &value)?;
        }
        if let Some(value) = lookup(ENV_BIND_ADDR) {
            self.tcp.bind_addr = parse_env(ENV_BIND_ADDR, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_FRAME_LEN) {
            let len: usize = parse_env(ENV_MAX_FRAME_LEN, &value)?;
            self.tcp.transport.max_message_size = len;
            self.ble.transport.max_message_size = len;
        }
        if let Some(value) = lookup(ENV_BLE_CHUNK_SIZE) {
            self.ble.default_chunk_size = parse_env(ENV_BLE_CHUNK_SIZE, &value)?;
        }
        if let Some(prefix) = lookup(ENV_BLE_DEVICE_PREFIX) {
            self.ble.device_name_prefix = prefix;
        }
        if let Some(value) = lookup(ENV_BLE_SCAN_TIMEOUT_SECS) {
            let secs: u64 = parse_env(ENV_BLE_SCAN_TIMEOUT_SECS, &value)?;
            self.ble.scan_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Apply command line flags, which win over everything else
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(name) = &cli.name {
            self.name = name.clone();
        }
        if let Some(codec) = &cli.codec {
            self.codec = codec.parse()?;
        }
        if let Commands::Serve { bind: Some(addr) } = &cli.command {
            self.tcp.bind_addr = *addr;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CliError::Config("name must not be empty".to_string()));
        }
        self.tcp.validate()?;
        self.ble.validate()?;
        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| CliError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
