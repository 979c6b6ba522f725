//! BLE transport configuration

use std::time::Duration;

use peerwire_core::{EomSentinel, PeerwireError, Result, TransportConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{
    DEFAULT_DEVICE_NAME_PREFIX, PEERWIRE_RX_CHARACTERISTIC_UUID, PEERWIRE_SERVICE_UUID,
    PEERWIRE_TX_CHARACTERISTIC_UUID,
};

/// Chunk size used when a link does not report its write limit
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Reassembly bound for one inbound message
pub const DEFAULT_BLE_MAX_MESSAGE_SIZE: usize = 512 * 1024;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE manager and the btleplug central
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// End-of-message sentinel written after every payload
    pub eom: EomSentinel,
    /// Write size used for links that report no limit
    pub default_chunk_size: usize,
    /// Shared transport settings (reassembly bound, name policy)
    pub transport: TransportConfig,
    /// Service advertised by peerwire peripherals
    pub service_uuid: Uuid,
    /// Characteristic chunks are written to
    pub tx_characteristic_uuid: Uuid,
    /// Characteristic chunks are notified on
    pub rx_characteristic_uuid: Uuid,
    /// Device name prefix for peer discovery; the remainder is the logical name
    pub device_name_prefix: String,
    /// How long a scan runs
    pub scan_timeout: Duration,
    /// Maximum time to wait for a connection
    pub connection_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            eom: EomSentinel::default(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            transport: TransportConfig::default()
                .with_max_message_size(DEFAULT_BLE_MAX_MESSAGE_SIZE),
            service_uuid: PEERWIRE_SERVICE_UUID,
            tx_characteristic_uuid: PEERWIRE_TX_CHARACTERISTIC_UUID,
            rx_characteristic_uuid: PEERWIRE_RX_CHARACTERISTIC_UUID,
            device_name_prefix: DEFAULT_DEVICE_NAME_PREFIX.to_string(),
            scan_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl BleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set EOM sentinel
    pub fn with_eom(mut self, eom: EomSentinel) -> Self {
        self.eom = eom;
        self
    }

    /// Set fallback chunk size
    pub fn with_default_chunk_size(mut self, size: usize) -> Self {
        self.default_chunk_size = size;
        self
    }

    /// Set reassembly bound
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.transport.max_message_size = size;
        self
    }

    /// Replace shared transport settings
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set device name prefix
    pub fn with_device_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_name_prefix = prefix.into();
        self
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.transport.max_message_size
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.default_chunk_size == 0 {
            return Err(PeerwireError::config_error("default_chunk_size must be positive"));
        }
        if self.device_name_prefix.is_empty() {
            return Err(PeerwireError::config_error("device_name_prefix must not be empty"));
        }
        if self.tx_characteristic_uuid == self.rx_characteristic_uuid {
            return Err(PeerwireError::config_error(
                "tx and rx characteristics must differ",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = BleConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.eom.as_bytes(), &[0xFF, 0xFF]);
        assert_eq!(cfg.default_chunk_size, 20);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let cfg = BleConfig::new().with_default_chunk_size(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn eom_reads_from_hex() {
        let cfg: BleConfig = serde_json::from_str(r#"{"eom": "0x00ff00"}"#).unwrap();
        assert_eq!(cfg.eom.as_bytes(), &[0x00, 0xFF, 0x00]);
        assert_eq!(cfg.default_chunk_size, DEFAULT_CHUNK_SIZE);

        assert!(serde_json::from_str::<BleConfig>(r#"{"eom": ""}"#).is_err());
    }
}
