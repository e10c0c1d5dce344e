//! In-process peer links.
//!
//! Links negotiate through ordinary signals: the initiator publishes an
//! offer and one candidate, the responder answers with its own pair, and
//! the pairing opens once the initiator holds the answer and a candidate.
//! Candidates applied before a description are rejected the same way a
//! real transport rejects them.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_types::SignalPayload;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{LinkError, SignalingError};
use crate::link::{LinkEvent, LinkFactory, LinkId, LinkNotice, PeerLink, Role};

/// Bytes a link may have in flight before `send` reports backpressure.
pub const DEFAULT_HIGH_WATER: usize = 1024 * 1024;

const SDP_PREFIX: &str = "memory:";

#[derive(Clone)]
struct Endpoint {
    link: LinkId,
    notices: UnboundedSender<LinkNotice>,
}

impl Endpoint {
    fn notify(&self, event: LinkEvent) {
        let _ = self.notices.send(LinkNotice {
            link: self.link,
            event,
        });
    }
}

struct Pairing {
    initiator: Endpoint,
    responder: Option<Endpoint>,
    connected: bool,
}

impl Pairing {
    fn other(&self, role: Role) -> Option<&Endpoint> {
        match role {
            Role::Initiator => self.responder.as_ref(),
            Role::Responder => Some(&self.initiator),
        }
    }
}

struct NetworkState {
    next_pairing: u64,
    pairings: HashMap<u64, Pairing>,
    high_water: usize,
}

/// Shared medium that memory links pair over.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                next_pairing: 1,
                pairings: HashMap::new(),
                high_water: high_water.max(1),
            })),
        }
    }

    /// A factory whose links report through `notices`.
    pub fn factory(&self, notices: UnboundedSender<LinkNotice>) -> MemoryLinkFactory {
        MemoryLinkFactory {
            network: self.clone(),
            notices,
        }
    }

    /// Drop every open pairing as if the network went away. Both ends see
    /// `LinkEvent::Closed`. Returns how many pairings were cut.
    pub fn sever_all(&self) -> usize {
        let mut state = self.inner.lock();
        let cut = state.pairings.len();
        for (_, pairing) in state.pairings.drain() {
            pairing.initiator.notify(LinkEvent::Closed);
            if let Some(responder) = &pairing.responder {
                responder.notify(LinkEvent::Closed);
            }
        }
        cut
    }

    pub fn open_pairings(&self) -> usize {
        self.inner.lock().pairings.len()
    }

    fn high_water(&self) -> usize {
        self.inner.lock().high_water
    }

    fn open(&self, initiator: Endpoint) -> u64 {
        let mut state = self.inner.lock();
        let id = state.next_pairing;
        state.next_pairing += 1;
        state.pairings.insert(
            id,
            Pairing {
                initiator,
                responder: None,
                connected: false,
            },
        );
        id
    }

    fn attach(&self, pairing: u64, responder: Endpoint) -> Result<(), SignalingError> {
        let mut state = self.inner.lock();
        let entry = state
            .pairings
            .get_mut(&pairing)
            .ok_or_else(|| {
                SignalingError::Malformed(format!("offer for unknown pairing {}", pairing))
            })?;
        if entry.responder.is_some() {
            return Err(SignalingError::UnexpectedSignal("offer already answered"));
        }
        entry.responder = Some(responder);
        Ok(())
    }

    fn connect(&self, pairing: u64) {
        let mut state = self.inner.lock();
        let Some(entry) = state.pairings.get_mut(&pairing) else {
            return;
        };
        let Some(responder) = entry.responder.clone() else {
            return;
        };
        if entry.connected {
            return;
        }
        entry.connected = true;
        entry.initiator.notify(LinkEvent::Connected);
        responder.notify(LinkEvent::Connected);
    }

    fn is_connected(&self, pairing: u64) -> bool {
        self.inner
            .lock()
            .pairings
            .get(&pairing)
            .is_some_and(|p| p.connected)
    }

    fn deliver(&self, pairing: u64, from: Role, frame: Bytes) -> Result<(), LinkError> {
        let state = self.inner.lock();
        let entry = state.pairings.get(&pairing).ok_or(LinkError::Closed)?;
        if !entry.connected {
            return Err(LinkError::NotOpen);
        }
        let peer = entry.other(from).ok_or(LinkError::NotOpen)?;
        peer.notify(LinkEvent::Data(frame));
        Ok(())
    }

    fn close(&self, pairing: u64, from: Role) {
        let mut state = self.inner.lock();
        if let Some(entry) = state.pairings.remove(&pairing)
            && let Some(peer) = entry.other(from)
        {
            peer.notify(LinkEvent::Closed);
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryLinkFactory {
    network: MemoryNetwork,
    notices: UnboundedSender<LinkNotice>,
}

impl LinkFactory for MemoryLinkFactory {
    type Link = MemoryLink;

    fn create(&mut self, id: LinkId, role: Role) -> Result<MemoryLink, LinkError> {
        if self.notices.is_closed() {
            return Err(LinkError::Create("notice channel closed".into()));
        }
        let mut link = MemoryLink {
            id,
            role,
            network: self.network.clone(),
            endpoint: Endpoint {
                link: id,
                notices: self.notices.clone(),
            },
            pairing: None,
            has_remote_description: false,
            remote_candidates: 0,
            unacked: 0,
            destroyed: false,
        };
        if role == Role::Initiator {
            let pairing = self.network.open(link.endpoint.clone());
            link.pairing = Some(pairing);
            link.publish(pairing, SignalPayload::Offer {
                sdp: format!("{}{}", SDP_PREFIX, pairing),
            });
        }
        Ok(link)
    }
}

pub struct MemoryLink {
    id: LinkId,
    role: Role,
    network: MemoryNetwork,
    endpoint: Endpoint,
    pairing: Option<u64>,
    has_remote_description: bool,
    remote_candidates: usize,
    unacked: usize,
    destroyed: bool,
}

impl MemoryLink {
    /// Emit a description followed by this side's candidate.
    fn publish(&self, pairing: u64, description: SignalPayload) {
        let side = match self.role {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        };
        self.endpoint.notify(LinkEvent::Signal(description));
        self.endpoint.notify(LinkEvent::Signal(SignalPayload::candidate(format!(
            "{}{}:{}",
            SDP_PREFIX, pairing, side
        ))));
    }

    fn try_connect(&self) {
        if let Some(pairing) = self.pairing
            && self.role == Role::Initiator
            && self.has_remote_description
            && self.remote_candidates > 0
        {
            self.network.connect(pairing);
        }
    }

    fn expect_pairing(&self, value: &str) -> Result<u64, SignalingError> {
        let pairing = parse_pairing(value)?;
        if self.pairing.is_some_and(|p| p != pairing) {
            return Err(SignalingError::Malformed(format!("signal for pairing {}", pairing)));
        }
        Ok(pairing)
    }
}

fn parse_pairing(value: &str) -> Result<u64, SignalingError> {
    value
        .strip_prefix(SDP_PREFIX)
        .and_then(|rest| rest.split(':').next())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| SignalingError::Malformed(value.to_string()))
}

impl PeerLink for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn apply_signal(&mut self, signal: &SignalPayload) -> Result<(), SignalingError> {
        if self.destroyed {
            return Err(SignalingError::NoSession);
        }
        match signal {
            SignalPayload::Offer { sdp } => {
                if self.role != Role::Responder || self.pairing.is_some() {
                    return Err(SignalingError::UnexpectedSignal("offer"));
                }
                let pairing = parse_pairing(sdp)?;
                self.network.attach(pairing, self.endpoint.clone())?;
                self.pairing = Some(pairing);
                self.has_remote_description = true;
                self.publish(pairing, SignalPayload::Answer {
                    sdp: format!("{}{}", SDP_PREFIX, pairing),
                });
            }
            SignalPayload::Answer { sdp } => {
                if self.role != Role::Initiator {
                    return Err(SignalingError::UnexpectedSignal("answer"));
                }
                self.expect_pairing(sdp)?;
                self.has_remote_description = true;
                self.try_connect();
            }
            SignalPayload::IceCandidate { candidate, .. } => {
                if !self.has_remote_description {
                    return Err(SignalingError::CandidateBeforeDescription);
                }
                self.expect_pairing(candidate)?;
                self.remote_candidates += 1;
                self.try_connect();
            }
        }
        Ok(())
    }

    fn send(&mut self, frame: Bytes) -> Result<bool, LinkError> {
        if self.destroyed {
            return Err(LinkError::NotOpen);
        }
        let pairing = self.pairing.ok_or(LinkError::NotOpen)?;
        let len = frame.len();
        self.network.deliver(pairing, self.role, frame)?;

        self.unacked += len;
        if self.unacked < self.network.high_water() {
            return Ok(true);
        }
        // Drain is reported asynchronously, after the frames already queued.
        self.unacked = 0;
        self.endpoint.notify(LinkEvent::Drained);
        Ok(false)
    }

    fn is_open(&self) -> bool {
        !self.destroyed && self.pairing.is_some_and(|p| self.network.is_connected(p))
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(pairing) = self.pairing {
            self.network.close(pairing, self.role);
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use super::*;

    fn drain(rx: &mut UnboundedReceiver<LinkNotice>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            events.push(notice.event);
        }
        events
    }

    fn signals(events: &[LinkEvent]) -> Vec<SignalPayload> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Signal(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_and_data() {
        let net = MemoryNetwork::with_high_water(10);
        let (a_tx, mut a_rx) = unbounded_channel();
        let (b_tx, mut b_rx) = unbounded_channel();
        let mut a = net.factory(a_tx).create(LinkId(1), Role::Initiator).unwrap();
        let mut b = net.factory(b_tx).create(LinkId(7), Role::Responder).unwrap();

        let offer_side = signals(&drain(&mut a_rx));
        assert_eq!(offer_side.len(), 2);

        // Candidate first is refused.
        assert_eq!(
            b.apply_signal(&offer_side[1]),
            Err(SignalingError::CandidateBeforeDescription)
        );
        b.apply_signal(&offer_side[0]).unwrap();
        b.apply_signal(&offer_side[1]).unwrap();

        let answer_side = signals(&drain(&mut b_rx));
        for s in &answer_side {
            a.apply_signal(s).unwrap();
        }
        assert_eq!(drain(&mut a_rx), vec![LinkEvent::Connected]);
        assert_eq!(drain(&mut b_rx), vec![LinkEvent::Connected]);
        assert!(a.is_open() && b.is_open());

        assert!(a.send(Bytes::from_static(b"hello")).unwrap());
        assert!(!a.send(Bytes::from_static(b"world!")).unwrap());
        assert_eq!(
            drain(&mut b_rx),
            vec![
                LinkEvent::Data(Bytes::from_static(b"hello")),
                LinkEvent::Data(Bytes::from_static(b"world!")),
            ]
        );
        assert_eq!(drain(&mut a_rx), vec![LinkEvent::Drained]);

        a.destroy();
        assert_eq!(drain(&mut b_rx), vec![LinkEvent::Closed]);
        assert!(!b.is_open());
        assert_eq!(net.open_pairings(), 0);
    }

    #[test]
    fn test_stale_offer_rejected() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = unbounded_channel();
        let (b_tx, _b_rx) = unbounded_channel();
        let mut a = net.factory(a_tx).create(LinkId(1), Role::Initiator).unwrap();
        let stale = signals(&drain(&mut a_rx));
        a.destroy();

        let mut b = net.factory(b_tx).create(LinkId(2), Role::Responder).unwrap();
        assert!(matches!(b.apply_signal(&stale[0]), Err(SignalingError::Malformed(_))));
        assert!(b.send(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_sever_all() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = unbounded_channel();
        let _a = net.factory(a_tx).create(LinkId(1), Role::Initiator).unwrap();
        drain(&mut a_rx);
        assert_eq!(net.sever_all(), 1);
        assert_eq!(drain(&mut a_rx), vec![LinkEvent::Closed]);
    }
}
