use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use tether_types::{PeerId, RendezvousEvent};

/// Default number of participants a room holds.
pub const DEFAULT_ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("room {0} is full")]
    RoomFull(String),

    #[error("room id must not be empty")]
    EmptyRoomId,
}

/// Tracks connected participants and the room each one is in.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RoomRegistryInner>,
}

struct RoomRegistryInner {
    capacity: usize,

    /// room_id -> members in join order
    rooms: RwLock<HashMap<String, Vec<PeerId>>>,

    /// peer_id -> room_id
    memberships: RwLock<HashMap<PeerId, String>>,

    /// Per-peer send channels
    channels: RwLock<HashMap<PeerId, mpsc::UnboundedSender<RendezvousEvent>>>,
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RoomRegistryInner {
                capacity: capacity.max(1),
                rooms: RwLock::new(HashMap::new()),
                memberships: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Assign an identity and a delivery channel to a new socket.
    pub async fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<RendezvousEvent>) {
        let peer_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.channels.write().await.insert(peer_id, tx);
        (peer_id, rx)
    }

    /// Drop a socket: leave its room, then forget its channel.
    pub async fn unregister(&self, peer_id: PeerId) {
        self.leave(peer_id).await;
        self.inner.channels.write().await.remove(&peer_id);
    }

    /// Send a targeted event to a specific peer.
    pub async fn send_to(&self, peer_id: PeerId, event: RendezvousEvent) -> bool {
        let channels = self.inner.channels.read().await;
        match channels.get(&peer_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Put `peer_id` into `room_id`, leaving any other room first.
    ///
    /// The joiner receives the prior members; each prior member learns of
    /// the joiner. Returns the prior members.
    pub async fn join(&self, peer_id: PeerId, room_id: &str) -> Result<Vec<PeerId>, JoinError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(JoinError::EmptyRoomId);
        }

        let (existing, left_behind) = {
            let mut rooms = self.inner.rooms.write().await;
            let mut memberships = self.inner.memberships.write().await;

            let current = memberships.get(&peer_id).cloned();
            if current.as_deref() == Some(room_id) {
                let others: Vec<PeerId> = rooms
                    .get(room_id)
                    .map(|members| members.iter().copied().filter(|m| *m != peer_id).collect())
                    .unwrap_or_default();
                return Ok(others);
            }

            let occupancy = rooms.get(room_id).map_or(0, Vec::len);
            if occupancy >= self.inner.capacity {
                return Err(JoinError::RoomFull(room_id.to_string()));
            }

            let left_behind = match current {
                Some(old) => remove_member(&mut rooms, &old, peer_id),
                None => Vec::new(),
            };

            let members = rooms.entry(room_id.to_string()).or_default();
            let existing = members.clone();
            members.push(peer_id);
            memberships.insert(peer_id, room_id.to_string());
            (existing, left_behind)
        };

        for member in left_behind {
            self.send_to(member, RendezvousEvent::UserDisconnected { user_id: peer_id }).await;
        }
        self.send_to(
            peer_id,
            RendezvousEvent::RoomUsers {
                room_id: room_id.to_string(),
                users: existing.clone(),
            },
        )
        .await;
        for member in &existing {
            self.send_to(*member, RendezvousEvent::UserConnected { user_id: peer_id }).await;
        }
        Ok(existing)
    }

    /// Remove `peer_id` from its room and tell the remaining members.
    pub async fn leave(&self, peer_id: PeerId) -> Option<String> {
        let (room_id, remaining) = {
            let mut rooms = self.inner.rooms.write().await;
            let mut memberships = self.inner.memberships.write().await;
            let room_id = memberships.remove(&peer_id)?;
            let remaining = remove_member(&mut rooms, &room_id, peer_id);
            (room_id, remaining)
        };

        for member in remaining {
            self.send_to(member, RendezvousEvent::UserDisconnected { user_id: peer_id }).await;
        }
        Some(room_id)
    }

    /// Deliver `event` from `from` to `to`, or to every other member of
    /// `from`'s room. Targets outside that room are skipped. Returns how
    /// many peers received it.
    pub async fn relay(&self, from: PeerId, to: Option<PeerId>, event: RendezvousEvent) -> usize {
        let others = self.room_peers(from).await;
        let targets: Vec<PeerId> = match to {
            Some(target) if others.contains(&target) => vec![target],
            Some(_) => Vec::new(),
            None => others,
        };

        let mut delivered = 0;
        for target in targets {
            if self.send_to(target, event.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Other members of `peer_id`'s room.
    pub async fn room_peers(&self, peer_id: PeerId) -> Vec<PeerId> {
        let Some(room_id) = self.inner.memberships.read().await.get(&peer_id).cloned() else {
            return Vec::new();
        };
        self.members(&room_id)
            .await
            .into_iter()
            .filter(|m| *m != peer_id)
            .collect()
    }

    pub async fn members(&self, room_id: &str) -> Vec<PeerId> {
        self.inner
            .rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CAPACITY)
    }
}

/// Returns the members still in the room. Empty rooms are dropped.
fn remove_member(
    rooms: &mut HashMap<String, Vec<PeerId>>,
    room_id: &str,
    peer_id: PeerId,
) -> Vec<PeerId> {
    let Some(members) = rooms.get_mut(room_id) else {
        return Vec::new();
    };
    members.retain(|m| *m != peer_id);
    let remaining = members.clone();
    if remaining.is_empty() {
        rooms.remove(room_id);
    }
    remaining
}

#[cfg(test)]
mod tests {
    use tether_types::SignalPayload;

    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<RendezvousEvent>) -> Vec<RendezvousEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_announces_both_ways() {
        let registry = RoomRegistry::default();
        let (a, mut a_rx) = registry.register().await;
        let (b, mut b_rx) = registry.register().await;

        assert_eq!(registry.join(a, "room-42").await, Ok(vec![]));
        assert_eq!(
            drain(&mut a_rx),
            vec![RendezvousEvent::RoomUsers { room_id: "room-42".into(), users: vec![] }]
        );

        assert_eq!(registry.join(b, "room-42").await, Ok(vec![a]));
        assert_eq!(
            drain(&mut b_rx),
            vec![RendezvousEvent::RoomUsers { room_id: "room-42".into(), users: vec![a] }]
        );
        assert_eq!(drain(&mut a_rx), vec![RendezvousEvent::UserConnected { user_id: b }]);
    }

    #[tokio::test]
    async fn test_third_joiner_rejected() {
        let registry = RoomRegistry::default();
        let (a, _a_rx) = registry.register().await;
        let (b, _b_rx) = registry.register().await;
        let (c, _c_rx) = registry.register().await;
        registry.join(a, "room-42").await.unwrap();
        registry.join(b, "room-42").await.unwrap();

        assert_eq!(registry.join(c, "room-42").await, Err(JoinError::RoomFull("room-42".into())));
        assert_eq!(registry.members("room-42").await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_relay_stays_in_room() {
        let registry = RoomRegistry::default();
        let (a, _a_rx) = registry.register().await;
        let (b, mut b_rx) = registry.register().await;
        let (c, mut c_rx) = registry.register().await;
        registry.join(a, "one").await.unwrap();
        registry.join(b, "one").await.unwrap();
        registry.join(c, "two").await.unwrap();
        drain(&mut b_rx);
        drain(&mut c_rx);

        let event = RendezvousEvent::Signal {
            from: a,
            signal: SignalPayload::Offer { sdp: "o".into() },
        };
        assert_eq!(registry.relay(a, None, event.clone()).await, 1);
        assert_eq!(registry.relay(a, Some(c), event.clone()).await, 0);
        assert_eq!(drain(&mut b_rx), vec![event]);
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining() {
        let registry = RoomRegistry::default();
        let (a, mut a_rx) = registry.register().await;
        let (b, _b_rx) = registry.register().await;
        registry.join(a, "room").await.unwrap();
        registry.join(b, "room").await.unwrap();
        drain(&mut a_rx);

        registry.unregister(b).await;
        assert_eq!(drain(&mut a_rx), vec![RendezvousEvent::UserDisconnected { user_id: b }]);
        assert_eq!(registry.members("room").await, vec![a]);
        assert!(!registry.send_to(b, RendezvousEvent::Ready { peer_id: b }).await);
    }

    #[tokio::test]
    async fn test_switching_rooms_leaves_old_one() {
        let registry = RoomRegistry::default();
        let (a, mut a_rx) = registry.register().await;
        let (b, _b_rx) = registry.register().await;
        registry.join(a, "old").await.unwrap();
        registry.join(b, "old").await.unwrap();
        drain(&mut a_rx);

        registry.join(b, "new").await.unwrap();
        assert_eq!(drain(&mut a_rx), vec![RendezvousEvent::UserDisconnected { user_id: b }]);
        assert_eq!(registry.room_peers(a).await, Vec::<PeerId>::new());
        assert_eq!(registry.join(a, " ").await, Err(JoinError::EmptyRoomId));
    }
}
