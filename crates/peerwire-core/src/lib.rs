//! peerwire core
//!
//! Transport-independent building blocks for moving typed payloads between
//! named peers: the tagged [`Envelope`] and its pluggable [`Codec`], the
//! length-prefixed framer used on stream links, the EOM-delimited chunk engine
//! used on BLE links, the connection lifecycle, observer events, and the peer
//! table that servers keep.
//!
//! The transport crates (`peerwire-tcp`, `peerwire-ble`) own the physical
//! links and drive these pieces.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod chunking;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod framing;
pub mod peers;
pub mod state;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use chunking::{EomSentinel, OutboundTransfer, Reassembler, TransferPhase, TransferStep};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use config::{DuplicateNamePolicy, TransportConfig};
pub use envelope::{Envelope, IDENTIFY_TYPE_CODE};
pub use errors::{CodecError, PeerwireError, ProtocolError, Result, TransportError};
pub use events::{
    ConnectionEvent, ConnectionEventReceiver, ConnectionEventSender, ConnectionStats, SendOutcome,
    SendReport, ServerEvent, ServerEventReceiver, ServerEventSender,
};
pub use framing::{FrameDecoder, DEFAULT_MAX_FRAME_LEN, SIZE_WIDTH};
pub use peers::{Identification, PeerEntry, PeerTable};
pub use state::{ConnectionState, StateTransitionError};
pub use types::{ConnectionId, PeerIdentity, TransportAddress};
