//! Shared transport configuration

use serde::{Deserialize, Serialize};

use crate::errors::{PeerwireError, Result};
use crate::framing::DEFAULT_MAX_FRAME_LEN;

// ----------------------------------------------------------------------------
// Duplicate Name Policy
// ----------------------------------------------------------------------------

/// What a server does when a peer identifies with a name already in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateNamePolicy {
    /// Keep the live peer, stop the newcomer
    #[default]
    RejectNew,
    /// Stop the live peer, the newcomer takes the name
    ReplaceExisting,
}

// ----------------------------------------------------------------------------
// Transport Configuration
// ----------------------------------------------------------------------------

/// Settings common to every transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest envelope accepted on receive or produced on send
    pub max_message_size: usize,
    /// Resolution of logical-name clashes
    pub duplicate_name_policy: DuplicateNamePolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_FRAME_LEN,
            duplicate_name_policy: DuplicateNamePolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set duplicate-name policy
    pub fn with_duplicate_name_policy(mut self, policy: DuplicateNamePolicy) -> Self {
        self.duplicate_name_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(PeerwireError::config_error("max_message_size must be positive"));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(PeerwireError::config_error(
                "max_message_size must fit the 32-bit size prefix",
            ));
        }
        Ok(())
    }
}
