//! Error types for peerwire
//!
//! Errors are grouped by how far their effect reaches. Transport and protocol
//! errors stop the one connection they occur on. Codec errors only fail the
//! message being encoded or decoded. `NotReady` and `Busy` are immediate send
//! failures with no wire activity.

use crate::state::ConnectionState;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Link-level failures: reads, writes, accepts and adapter access
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Connection closed by remote peer")]
    ConnectionClosed,
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },
    #[error("Accept failed: {reason}")]
    AcceptFailed { reason: String },
    #[error("Link unavailable: {reason}")]
    LinkUnavailable { reason: String },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
}

/// Violations of the wire contract by a peer (or by a send that would produce one)
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame too large: declared {declared} bytes (max: {max})")]
    FrameTooLarge { declared: usize, max: usize },
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Envelope is empty (missing type tag)")]
    EmptyEnvelope,
    #[error("Type code {code:#04x} is reserved")]
    ReservedTypeCode { code: u8 },
    #[error("Logical name {name:?} is already held by a live peer")]
    DuplicateName { name: String },
    #[error("Chunk {index} is byte-identical to the EOM sentinel")]
    EomCollision { index: usize },
    #[error("Reassembly buffer exceeded {max} bytes")]
    ReassemblyOverflow { max: usize },
}

/// Failures encoding or decoding a single payload
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Binary codec error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unexpected type code: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedType { expected: u8, actual: u8 },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for peerwire
#[derive(Debug, thiserror::Error)]
pub enum PeerwireError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection not ready (state: {state})")]
    NotReady { state: ConnectionState },

    #[error("Peer {peer} already has a transfer in flight")]
    Busy { peer: String },

    #[error("Peer not found: {name}")]
    PeerNotFound { name: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Event or task channel closed underneath us
    #[error("Channel error: {message}")]
    Channel { message: String },
}

impl From<std::io::Error> for PeerwireError {
    fn from(err: std::io::Error) -> Self {
        PeerwireError::Transport(TransportError::NetworkIo(err))
    }
}

impl From<bincode::Error> for PeerwireError {
    fn from(err: bincode::Error) -> Self {
        PeerwireError::Codec(CodecError::Bincode(err))
    }
}

impl From<serde_json::Error> for PeerwireError {
    fn from(err: serde_json::Error) -> Self {
        PeerwireError::Codec(CodecError::Json(err))
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PeerwireError {
    /// Create a not-ready error for a connection in `state`
    pub fn not_ready(state: ConnectionState) -> Self {
        PeerwireError::NotReady { state }
    }

    /// Create a busy error for a peer with a transfer already in flight
    pub fn busy<T: Into<String>>(peer: T) -> Self {
        PeerwireError::Busy { peer: peer.into() }
    }

    /// Create a peer-not-found error
    pub fn peer_not_found<T: Into<String>>(name: T) -> Self {
        PeerwireError::PeerNotFound { name: name.into() }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PeerwireError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PeerwireError::Channel {
            message: message.into(),
        }
    }

    /// Create a write failure
    pub fn write_failed<T: Into<String>>(reason: T) -> Self {
        PeerwireError::Transport(TransportError::WriteFailed {
            reason: reason.into(),
        })
    }

    /// Create a link-unavailable failure
    pub fn link_unavailable<T: Into<String>>(reason: T) -> Self {
        PeerwireError::Transport(TransportError::LinkUnavailable {
            reason: reason.into(),
        })
    }

    /// Create a shutdown error
    pub fn shutdown<T: Into<String>>(reason: T) -> Self {
        PeerwireError::Transport(TransportError::Shutdown {
            reason: reason.into(),
        })
    }

    /// Link-level failure
    pub fn is_transport(&self) -> bool {
        matches!(self, PeerwireError::Transport(_))
    }

    /// Wire contract violation
    pub fn is_protocol(&self) -> bool {
        matches!(self, PeerwireError::Protocol(_))
    }

    /// Single-message encode/decode failure
    pub fn is_codec(&self) -> bool {
        matches!(self, PeerwireError::Codec(_))
    }

    /// Whether this error must stop the connection it occurred on
    pub fn is_fatal_to_connection(&self) -> bool {
        self.is_transport() || self.is_protocol()
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, PeerwireError>;
