//! TCP transport configuration

use std::net::SocketAddr;

use peerwire_core::{Result, TransportConfig};
use serde::{Deserialize, Serialize};

/// Default listening port
pub const DEFAULT_PORT: u16 = 47800;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the TCP server and connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Address the server listens on
    pub bind_addr: SocketAddr,
    /// Disable Nagle's algorithm on every socket
    pub nodelay: bool,
    /// Shared transport settings (frame size limit, name policy)
    pub transport: TransportConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            nodelay: true,
            transport: TransportConfig::default(),
        }
    }
}

impl TcpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config listening on an ephemeral loopback port
    pub fn loopback() -> Self {
        Self::default().with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    /// Set bind address
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Set maximum frame length
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.transport.max_message_size = len;
        self
    }

    /// Replace shared transport settings
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.transport.max_message_size
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let cfg = TcpConfig::loopback()
            .with_nodelay(false)
            .with_max_frame_len(1024);
        assert_eq!(cfg.bind_addr.ip().to_string(), "127.0.0.1");
        assert_eq!(cfg.bind_addr.port(), 0);
        assert!(!cfg.nodelay);
        assert_eq!(cfg.max_frame_len(), 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: TcpConfig = serde_json::from_str(r#"{"nodelay": false}"#).unwrap();
        assert_eq!(cfg.bind_addr.port(), DEFAULT_PORT);
        assert!(!cfg.nodelay);
    }
}
