use std::fmt;

use bytes::Bytes;
use tether_types::SignalPayload;

use crate::error::{LinkError, SignalingError};

/// Which side of the negotiation a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First in the room. Creates the offer once a peer arrives.
    Initiator,
    /// Joined an occupied room. Answers the initiator's offer.
    Responder,
}

/// Generation number of a link. Every recreated link gets a fresh id, so
/// events still queued from a destroyed link can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Something a link reports asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Local negotiation payload to forward to the remote peer
    Signal(SignalPayload),
    /// Data channel is open
    Connected,
    /// Frame received from the remote peer
    Data(Bytes),
    /// Send buffer fell below its threshold after a send reported backpressure
    Drained,
    Error(LinkError),
    Closed,
}

/// A link event tagged with the link that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkNotice {
    pub link: LinkId,
    pub event: LinkEvent,
}

/// One peer-to-peer data channel. Events flow out through the notice channel
/// the factory was built with.
pub trait PeerLink: Send {
    fn id(&self) -> LinkId;

    fn role(&self) -> Role;

    /// Hand a remote negotiation payload to the transport.
    fn apply_signal(&mut self, signal: &SignalPayload) -> Result<(), SignalingError>;

    /// Queue a frame. `Ok(false)` means the buffer is above its high-water
    /// mark and the caller should wait for `LinkEvent::Drained`.
    fn send(&mut self, frame: Bytes) -> Result<bool, LinkError>;

    fn is_open(&self) -> bool;

    /// Tear the link down. Calling it twice is harmless.
    fn destroy(&mut self);
}

pub trait LinkFactory {
    type Link: PeerLink;

    fn create(&mut self, id: LinkId, role: Role) -> Result<Self::Link, LinkError>;
}
