//! Error types for the BLE transport

use peerwire_core::{PeerwireError, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failures specific to the btleplug central
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Link is disconnected")]
    Disconnected,

    #[error("Bluetooth stack error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleError> for PeerwireError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Disconnected => PeerwireError::Transport(TransportError::ConnectionClosed),
            other => PeerwireError::link_unavailable(other.to_string()),
        }
    }
}
