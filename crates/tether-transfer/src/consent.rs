use std::collections::HashMap;

use bytes::Bytes;
use tether_types::{PeerId, TransferMetadata};
use uuid::Uuid;

use crate::error::TransferError;

/// A file waiting on the receiver's verdict.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub transfer_id: Uuid,
    pub name: String,
    pub data: Bytes,
}

impl PendingOffer {
    pub fn metadata(&self) -> TransferMetadata {
        TransferMetadata::new(self.name.clone(), self.data.len() as u64)
    }
}

/// Sender side: holds a file back until the receiver accepts it.
#[derive(Debug, Default)]
pub struct ConsentGate {
    pending: Option<PendingOffer>,
}

impl ConsentGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a file and return the request to relay. Only one offer may be
    /// outstanding.
    pub fn offer(
        &mut self,
        name: impl Into<String>,
        data: Bytes,
    ) -> Result<&PendingOffer, TransferError> {
        if self.pending.is_some() {
            return Err(TransferError::TransferInProgress);
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TransferError::EmptyFileName);
        }
        Ok(self.pending.insert(PendingOffer {
            transfer_id: Uuid::new_v4(),
            name,
            data,
        }))
    }

    pub fn pending(&self) -> Option<&PendingOffer> {
        self.pending.as_ref()
    }

    /// Release the parked file if the acceptance matches it.
    pub fn on_accepted(&mut self, transfer_id: Uuid) -> Option<PendingOffer> {
        match &self.pending {
            Some(offer) if offer.transfer_id == transfer_id => self.pending.take(),
            _ => {
                tracing::debug!("Acceptance for unknown transfer {}", transfer_id);
                None
            }
        }
    }

    /// Drop the parked file if the rejection matches it.
    pub fn on_rejected(&mut self, transfer_id: Uuid, reason: &str) -> Option<TransferError> {
        match &self.pending {
            Some(offer) if offer.transfer_id == transfer_id => {
                self.pending = None;
                Some(TransferError::ConsentRejected(reason.to_string()))
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub from: PeerId,
    pub transfer_id: Uuid,
    pub metadata: TransferMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    Accept { to: PeerId, transfer_id: Uuid },
    Reject { to: PeerId, transfer_id: Uuid, reason: String },
}

/// Receiver side: requests awaiting a decision from the host.
#[derive(Debug, Default)]
pub struct ConsentInbox {
    requests: HashMap<Uuid, InboundRequest>,
}

impl ConsentInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, request: InboundRequest) {
        self.requests.insert(request.transfer_id, request);
    }

    pub fn get(&self, transfer_id: Uuid) -> Option<&InboundRequest> {
        self.requests.get(&transfer_id)
    }

    /// Resolve a request. Deciding twice, or on an unknown id, does nothing.
    pub fn decide(
        &mut self,
        transfer_id: Uuid,
        accept: bool,
        reason: Option<String>,
    ) -> Option<ConsentDecision> {
        let request = self.requests.remove(&transfer_id)?;
        Some(if accept {
            ConsentDecision::Accept {
                to: request.from,
                transfer_id,
            }
        } else {
            ConsentDecision::Reject {
                to: request.from,
                transfer_id,
                reason: reason.unwrap_or_else(|| "declined".to_string()),
            }
        })
    }

    /// Drop everything from a peer that left.
    pub fn forget(&mut self, peer: PeerId) {
        self.requests.retain(|_, r| r.from != peer);
    }
}
