use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier the relay assigns to each connected participant.
pub type PeerId = Uuid;

/// Describes a file before any of its bytes are sent.
///
/// The same record travels over the relay (inside a consent request) and
/// over the peer link (as the first frame of a transfer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
}

impl TransferMetadata {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}
