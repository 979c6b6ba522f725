//! Chunked transfer engine for write-size-constrained links
//!
//! Outbound, a payload is carved into `chunk_size` pieces followed by a fixed
//! EOM sentinel write. Inbound, chunks from each source accumulate until a
//! chunk exactly equal to the sentinel arrives. There is no length header, so
//! boundaries are purely EOM-delimited.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::{PeerwireError, ProtocolError, Result};

/// Default sentinel, two 0xFF bytes
pub const DEFAULT_EOM: [u8; 2] = [0xFF, 0xFF];

// ----------------------------------------------------------------------------
// EOM Sentinel
// ----------------------------------------------------------------------------

/// End-of-message marker, compared by exact byte equality
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EomSentinel(SmallVec<[u8; 4]>);

impl EomSentinel {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PeerwireError::config_error("EOM sentinel must not be empty"));
        }
        Ok(Self(SmallVec::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn matches(&self, chunk: &[u8]) -> bool {
        self.0.as_slice() == chunk
    }
}

impl Default for EomSentinel {
    fn default() -> Self {
        Self(SmallVec::from_slice(&DEFAULT_EOM))
    }
}

impl fmt::Debug for EomSentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EomSentinel(0x{})", hex::encode(&self.0))
    }
}

impl TryFrom<String> for EomSentinel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let digits = value.trim_start_matches("0x");
        let bytes = hex::decode(digits).map_err(|e| format!("invalid EOM hex {:?}: {}", value, e))?;
        EomSentinel::new(&bytes).map_err(|e| e.to_string())
    }
}

impl From<EomSentinel> for String {
    fn from(eom: EomSentinel) -> Self {
        format!("0x{}", hex::encode(&eom.0))
    }
}

// ----------------------------------------------------------------------------
// Outbound Transfer
// ----------------------------------------------------------------------------

/// Number of data chunks `len` bytes split into at `chunk_size`
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size)
}

/// Progress of one outbound transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Data chunks remain
    Sending,
    /// All data written, sentinel pending
    AwaitingEom,
    /// Sentinel written
    Complete,
}

/// One write the link should perform next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep<'a> {
    Data(&'a [u8]),
    Eom(&'a [u8]),
}

impl<'a> TransferStep<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        match self {
            TransferStep::Data(b) | TransferStep::Eom(b) => b,
        }
    }
}

/// Single-owner state machine emitting the writes for one payload
///
/// The caller asks for the current step, writes it once the link signals
/// readiness, then calls [`OutboundTransfer::advance`].
#[derive(Debug)]
pub struct OutboundTransfer {
    payload: Vec<u8>,
    chunk_size: usize,
    offset: usize,
    phase: TransferPhase,
    eom: EomSentinel,
}

impl OutboundTransfer {
    /// Plan a transfer, rejecting plans that the receiver would misread.
    ///
    /// A data chunk byte-identical to the sentinel would be taken for EOM by
    /// the receiver, so such a payload is refused before any write happens.
    pub fn new(payload: Vec<u8>, chunk_size: usize, eom: EomSentinel) -> Result<Self> {
        if chunk_size == 0 {
            return Err(PeerwireError::config_error("chunk size must be at least 1"));
        }
        if let Some(index) = payload.chunks(chunk_size).position(|c| eom.matches(c)) {
            return Err(ProtocolError::EomCollision { index }.into());
        }
        let phase = if payload.is_empty() {
            TransferPhase::AwaitingEom
        } else {
            TransferPhase::Sending
        };
        Ok(Self {
            payload,
            chunk_size,
            offset: 0,
            phase,
            eom,
        })
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase == TransferPhase::Complete
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes of payload already advanced past
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total writes including the sentinel
    pub fn total_writes(&self) -> usize {
        chunk_count(self.payload.len(), self.chunk_size) + 1
    }

    /// The write to perform next, `None` once complete
    pub fn current(&self) -> Option<TransferStep<'_>> {
        match self.phase {
            TransferPhase::Sending => {
                let end = (self.offset + self.chunk_size).min(self.payload.len());
                Some(TransferStep::Data(&self.payload[self.offset..end]))
            }
            TransferPhase::AwaitingEom => Some(TransferStep::Eom(self.eom.as_bytes())),
            TransferPhase::Complete => None,
        }
    }

    /// Record that the current step was written
    pub fn advance(&mut self) {
        match self.phase {
            TransferPhase::Sending => {
                self.offset = (self.offset + self.chunk_size).min(self.payload.len());
                if self.offset == self.payload.len() {
                    self.phase = TransferPhase::AwaitingEom;
                }
            }
            TransferPhase::AwaitingEom => self.phase = TransferPhase::Complete,
            TransferPhase::Complete => {}
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound Reassembly
// ----------------------------------------------------------------------------

/// Per-source accumulation of inbound chunks
///
/// An entry exists only while a receive is in progress; it is removed the
/// moment the sentinel is recognised.
#[derive(Debug)]
pub struct Reassembler<K> {
    buffers: HashMap<K, Vec<u8>>,
    eom: EomSentinel,
    max_message_size: usize,
}

impl<K> Reassembler<K>
where
    K: Hash + Eq + Clone + fmt::Debug,
{
    pub fn new(eom: EomSentinel, max_message_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            eom,
            max_message_size,
        }
    }

    /// Feed one chunk from `source`; returns a complete message on EOM.
    ///
    /// A buffer that would grow past `max_message_size` is discarded and the
    /// overflow reported; the next chunk from that source starts afresh.
    pub fn accept(&mut self, source: &K, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.eom.matches(chunk) {
            let message = self.buffers.remove(source).unwrap_or_default();
            return Ok(Some(message));
        }

        let pending = self.buffers.get(source).map_or(0, Vec::len);
        if pending + chunk.len() > self.max_message_size {
            self.buffers.remove(source);
            return Err(ProtocolError::ReassemblyOverflow {
                max: self.max_message_size,
            }
            .into());
        }

        self.buffers
            .entry(source.clone())
            .or_default()
            .extend_from_slice(chunk);
        Ok(None)
    }

    /// Whether a receive from `source` is in progress
    pub fn is_pending(&self, source: &K) -> bool {
        self.buffers.contains_key(source)
    }

    /// Bytes buffered for `source`
    pub fn pending_len(&self, source: &K) -> usize {
        self.buffers.get(source).map_or(0, Vec::len)
    }

    /// Drop any partial message from `source`; returns the bytes discarded
    pub fn discard(&mut self, source: &K) -> usize {
        self.buffers.remove(source).map_or(0, |b| b.len())
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Sources with an in-progress receive
    pub fn pending_sources(&self) -> usize {
        self.buffers.len()
    }
}
