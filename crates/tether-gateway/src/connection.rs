use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use tether_types::{PeerId, RendezvousCommand, RendezvousEvent, SignalPayload};

use crate::rooms::{JoinError, RoomRegistry};

/// Heartbeat interval: the relay pings every 15 seconds and drops the
/// socket after 2 consecutive missed pongs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one participant socket until either side goes away.
pub async fn handle_connection(socket: WebSocket, registry: RoomRegistry) {
    let (peer_id, mut peer_rx) = registry.register().await;
    let (mut sender, mut receiver) = socket.split();

    info!("{} connected to relay", peer_id);

    if send_event(&mut sender, &RendezvousEvent::Ready { peer_id }).await.is_err() {
        registry.unregister(peer_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = peer_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "{} heartbeat timeout (missed {} pongs), dropping",
                                peer_id, missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let registry_recv = registry.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RendezvousCommand>(&text) {
                    Ok(cmd) => handle_command(&registry_recv, peer_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            peer_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Binary(data) => {
                    debug!("{} sent {} binary bytes, relay carries text only", peer_id, data.len());
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.unregister(peer_id).await;
    info!("{} disconnected from relay", peer_id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RendezvousEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

pub(crate) async fn handle_command(
    registry: &RoomRegistry,
    peer_id: PeerId,
    cmd: RendezvousCommand,
) {
    match cmd {
        RendezvousCommand::JoinRoom { room_id } => match registry.join(peer_id, &room_id).await {
            Ok(existing) => {
                info!("{} joined room {} ({} already there)", peer_id, room_id, existing.len());
            }
            Err(JoinError::RoomFull(room_id)) => {
                info!("{} turned away from full room {}", peer_id, room_id);
                registry.send_to(peer_id, RendezvousEvent::RoomFull { room_id }).await;
            }
            Err(e) => warn!("{} join rejected: {}", peer_id, e),
        },

        RendezvousCommand::LeaveRoom => {
            if let Some(room_id) = registry.leave(peer_id).await {
                info!("{} left room {}", peer_id, room_id);
            }
        }

        RendezvousCommand::Signal { to, signal } => {
            let signal_desc = match &signal {
                SignalPayload::Offer { .. } => "Offer",
                SignalPayload::Answer { .. } => "Answer",
                SignalPayload::IceCandidate { .. } => "IceCandidate",
            };
            let delivered = registry
                .relay(peer_id, to, RendezvousEvent::Signal { from: peer_id, signal })
                .await;
            if delivered == 0 {
                warn!("{} -> {} dropped, no recipient in room", peer_id, signal_desc);
            } else {
                debug!("{} -> {} to {} peer(s)", peer_id, signal_desc, delivered);
            }
        }

        RendezvousCommand::TransferRequest {
            to,
            transfer_id,
            metadata,
        } => {
            info!(
                "{} -> transfer request {} ({:?}, {} bytes)",
                peer_id, transfer_id, metadata.name, metadata.size
            );
            registry
                .relay(
                    peer_id,
                    to,
                    RendezvousEvent::TransferRequest {
                        from: peer_id,
                        transfer_id,
                        metadata,
                    },
                )
                .await;
        }

        RendezvousCommand::TransferAccepted { to, transfer_id } => {
            info!("{} -> accepted {}", peer_id, transfer_id);
            registry
                .relay(
                    peer_id,
                    Some(to),
                    RendezvousEvent::TransferAccepted {
                        from: peer_id,
                        transfer_id,
                    },
                )
                .await;
        }

        RendezvousCommand::TransferRejected {
            to,
            transfer_id,
            reason,
        } => {
            info!("{} -> rejected {}: {}", peer_id, transfer_id, reason);
            registry
                .relay(
                    peer_id,
                    Some(to),
                    RendezvousEvent::TransferRejected {
                        from: peer_id,
                        transfer_id,
                        reason,
                    },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use tether_types::TransferMetadata;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    use super::*;

    fn drain(rx: &mut UnboundedReceiver<RendezvousEvent>) -> Vec<RendezvousEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_full_room_reply() {
        let registry = RoomRegistry::new(1);
        let (a, _a_rx) = registry.register().await;
        let (b, mut b_rx) = registry.register().await;
        handle_command(&registry, a, RendezvousCommand::JoinRoom { room_id: "solo".into() }).await;
        handle_command(&registry, b, RendezvousCommand::JoinRoom { room_id: "solo".into() }).await;

        assert_eq!(drain(&mut b_rx), vec![RendezvousEvent::RoomFull { room_id: "solo".into() }]);
    }

    #[tokio::test]
    async fn test_consent_round_trip_relayed() {
        let registry = RoomRegistry::default();
        let (a, mut a_rx) = registry.register().await;
        let (b, mut b_rx) = registry.register().await;
        handle_command(&registry, a, RendezvousCommand::JoinRoom { room_id: "r".into() }).await;
        handle_command(&registry, b, RendezvousCommand::JoinRoom { room_id: "r".into() }).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let transfer_id = Uuid::new_v4();
        let metadata = TransferMetadata::new("photo.jpg", 2048);
        handle_command(
            &registry,
            a,
            RendezvousCommand::TransferRequest {
                to: None,
                transfer_id,
                metadata: metadata.clone(),
            },
        )
        .await;
        assert_eq!(
            drain(&mut b_rx),
            vec![RendezvousEvent::TransferRequest { from: a, transfer_id, metadata }]
        );

        handle_command(
            &registry,
            b,
            RendezvousCommand::TransferRejected { to: a, transfer_id, reason: "declined".into() },
        )
        .await;
        assert_eq!(
            drain(&mut a_rx),
            vec![RendezvousEvent::TransferRejected {
                from: b,
                transfer_id,
                reason: "declined".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_signal_broadcast_to_room() {
        let registry = RoomRegistry::default();
        let (a, _a_rx) = registry.register().await;
        let (b, mut b_rx) = registry.register().await;
        handle_command(&registry, a, RendezvousCommand::JoinRoom { room_id: "r".into() }).await;
        handle_command(&registry, b, RendezvousCommand::JoinRoom { room_id: "r".into() }).await;
        drain(&mut b_rx);

        let signal = SignalPayload::candidate("c1");
        let command = RendezvousCommand::Signal { to: None, signal: signal.clone() };
        handle_command(&registry, a, command).await;
        assert_eq!(drain(&mut b_rx), vec![RendezvousEvent::Signal { from: a, signal }]);

        handle_command(&registry, b, RendezvousCommand::LeaveRoom).await;
        assert!(registry.room_peers(a).await.is_empty());
    }
}
