use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use tether_types::{PeerId, RendezvousCommand, RendezvousEvent, SignalPayload, TransferMetadata};

use crate::error::ClientError;

/// Sending half of a relay connection.
///
/// Commands are queued on a channel and written by a background task, so
/// every method is synchronous and cheap.
#[derive(Clone)]
pub struct RendezvousClient {
    commands: mpsc::UnboundedSender<RendezvousCommand>,
}

impl RendezvousClient {
    /// Open a WebSocket to the relay. Events arrive on the returned
    /// receiver, which closes when the socket does.
    pub async fn connect(
        url: &str,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<RendezvousEvent>)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("WS connect to {} failed", url))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<RendezvousCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let text = match serde_json::to_string(&cmd) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Could not encode relay command: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<RendezvousEvent>(&text) {
                            Ok(event) => {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Bad relay event: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Relay socket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((Self { commands: cmd_tx }, event_rx))
    }

    /// Wrap an existing command channel, for relays reached some other way.
    pub fn from_sender(commands: mpsc::UnboundedSender<RendezvousCommand>) -> Self {
        Self { commands }
    }

    pub fn send(&self, command: RendezvousCommand) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::RelayClosed)
    }

    pub fn join(&self, room_id: &str) -> Result<(), ClientError> {
        self.send(RendezvousCommand::JoinRoom {
            room_id: room_id.to_string(),
        })
    }

    pub fn leave(&self) -> Result<(), ClientError> {
        self.send(RendezvousCommand::LeaveRoom)
    }

    pub fn send_signal(
        &self,
        to: Option<PeerId>,
        signal: SignalPayload,
    ) -> Result<(), ClientError> {
        self.send(RendezvousCommand::Signal { to, signal })
    }

    pub fn send_transfer_request(
        &self,
        to: Option<PeerId>,
        transfer_id: Uuid,
        metadata: TransferMetadata,
    ) -> Result<(), ClientError> {
        self.send(RendezvousCommand::TransferRequest {
            to,
            transfer_id,
            metadata,
        })
    }

    pub fn send_transfer_decision(
        &self,
        to: PeerId,
        transfer_id: Uuid,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        let command = if accepted {
            RendezvousCommand::TransferAccepted { to, transfer_id }
        } else {
            RendezvousCommand::TransferRejected {
                to,
                transfer_id,
                reason: reason.unwrap_or_else(|| "declined".to_string()),
            }
        };
        self.send(command)
    }
}
