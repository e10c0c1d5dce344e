use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{PeerId, TransferMetadata};

/// Events sent FROM the relay TO a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RendezvousEvent {
    /// Relay accepted the socket and assigned an identity
    Ready { peer_id: PeerId },

    /// Members already in the room, sent only to the joiner
    RoomUsers { room_id: String, users: Vec<PeerId> },

    /// Another participant joined the caller's room
    UserConnected { user_id: PeerId },

    /// A participant left the caller's room or dropped its socket
    UserDisconnected { user_id: PeerId },

    /// Opaque negotiation payload forwarded from another member
    Signal { from: PeerId, signal: SignalPayload },

    /// The room already holds its maximum number of members
    RoomFull { room_id: String },

    /// A sender asks permission before streaming a file
    TransferRequest {
        from: PeerId,
        transfer_id: Uuid,
        metadata: TransferMetadata,
    },

    TransferAccepted { from: PeerId, transfer_id: Uuid },

    TransferRejected {
        from: PeerId,
        transfer_id: Uuid,
        reason: String,
    },
}

/// Commands sent FROM a participant TO the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RendezvousCommand {
    /// Join (or switch to) a room
    JoinRoom { room_id: String },

    /// Leave the current room
    LeaveRoom,

    /// Forward a negotiation payload. `None` targets every other room member.
    Signal {
        to: Option<PeerId>,
        signal: SignalPayload,
    },

    TransferRequest {
        to: Option<PeerId>,
        transfer_id: Uuid,
        metadata: TransferMetadata,
    },

    TransferAccepted { to: PeerId, transfer_id: Uuid },

    TransferRejected {
        to: PeerId,
        transfer_id: Uuid,
        reason: String,
    },
}

/// Negotiation payload relayed between peers.
///
/// The relay never inspects it. Peers only look at whether it is a
/// session description or a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal_type")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Description,
    Candidate,
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } | Self::Answer { .. } => SignalKind::Description,
            Self::IceCandidate { .. } => SignalKind::Candidate,
        }
    }

    pub fn is_description(&self) -> bool {
        self.kind() == SignalKind::Description
    }

    pub fn candidate(candidate: impl Into<String>) -> Self {
        Self::IceCandidate {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }
}
