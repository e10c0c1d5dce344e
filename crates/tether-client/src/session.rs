//! Per-participant event loop.
//!
//! [`SessionDriver::run`] owns the connection machine and both transfer
//! engines. Relay events, link notices, host commands, the reconnect timer
//! and the active send all feed one `select!` loop, so nothing inside it
//! needs locking.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::{task, time};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_transfer::{
    Artifact, ConnectionAction, ConnectionConfig, ConnectionEvent, ConnectionMachine,
    ConnectionState, ConsentDecision, ConsentGate, ConsentInbox, InboundRequest, LinkError,
    LinkEvent, LinkFactory, LinkNotice, ProtocolViolation, ReceiveOutcome, SendStep,
    TracingLogger, TransferConfig, TransferError, TransferLogger, TransferProgress,
    TransferReceiver, TransferSender,
};
use tether_types::{PeerId, RendezvousEvent, TransferMetadata};

use crate::error::ClientError;
use crate::rendezvous::RendezvousClient;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub room_id: String,
    pub transfer: TransferConfig,
    pub connection: ConnectionConfig,
}

impl SessionOptions {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            transfer: TransferConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    pub fn from_env(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            transfer: TransferConfig::from_env(),
            connection: ConnectionConfig::from_env(),
        }
    }
}

#[derive(Debug)]
pub enum SessionCommand {
    SendFile { name: String, data: Bytes },
    CancelSend,
    Decide {
        transfer_id: Uuid,
        accept: bool,
        reason: Option<String>,
    },
    Leave,
}

/// Notifications for the host application.
#[derive(Debug)]
pub enum SessionUpdate {
    Ready { peer_id: PeerId },
    State(ConnectionState),
    RoomFull { room_id: String },

    /// The other side wants to send a file; answer with `decide`
    ConsentRequested(InboundRequest),
    /// Our offer is parked until the other side answers
    AwaitingConsent {
        transfer_id: Uuid,
        metadata: TransferMetadata,
    },

    SendProgress {
        transfer_id: Uuid,
        progress: TransferProgress,
    },
    SendComplete { transfer_id: Uuid },
    SendCancelled { transfer_id: Uuid },
    SendFailed {
        transfer_id: Option<Uuid>,
        error: TransferError,
    },

    ReceiveStarted(TransferMetadata),
    ReceiveProgress(TransferProgress),
    Received(Artifact),
    ReceiveAborted { file_name: String, received: u64 },
    /// The link dropped mid-transfer and the partial file was thrown away
    ReceiveDiscarded(TransferMetadata),
    ProtocolViolation(ProtocolViolation),
}

/// Host-side handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::SessionClosed)
    }

    pub fn send_file(
        &self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.send(SessionCommand::SendFile {
            name: name.into(),
            data: data.into(),
        })
    }

    pub fn cancel_send(&self) -> Result<(), ClientError> {
        self.send(SessionCommand::CancelSend)
    }

    pub fn decide(
        &self,
        transfer_id: Uuid,
        accept: bool,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        self.send(SessionCommand::Decide {
            transfer_id,
            accept,
            reason,
        })
    }

    pub fn leave(&self) -> Result<(), ClientError> {
        self.send(SessionCommand::Leave)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct SessionDriver<F: LinkFactory> {
    session: Session<F>,
    events: mpsc::UnboundedReceiver<RendezvousEvent>,
    link_notices: mpsc::UnboundedReceiver<LinkNotice>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl<F: LinkFactory> SessionDriver<F> {
    /// `factory` must report through the sender paired with `link_notices`.
    pub fn new(
        options: SessionOptions,
        factory: F,
        link_notices: mpsc::UnboundedReceiver<LinkNotice>,
        relay: RendezvousClient,
        events: mpsc::UnboundedReceiver<RendezvousEvent>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let logger: Arc<dyn TransferLogger> = Arc::new(TracingLogger);

        let session = Session {
            room_id: options.room_id,
            peer_id: None,
            machine: ConnectionMachine::new(factory, options.connection),
            receiver: TransferReceiver::new(options.transfer.framing, logger.clone()),
            config: options.transfer,
            sending: None,
            awaiting_drain: false,
            gate: ConsentGate::new(),
            inbox: ConsentInbox::new(),
            relay,
            updates: update_tx,
            reconnect_at: None,
            logger,
        };
        let driver = Self {
            session,
            events,
            link_notices,
            commands: cmd_rx,
        };
        (driver, SessionHandle { commands: cmd_tx }, update_rx)
    }

    /// Join the room and serve it until the host leaves, the room turns
    /// out to be full, or the relay goes away.
    pub async fn run(self) -> anyhow::Result<()> {
        let SessionDriver {
            mut session,
            mut events,
            mut link_notices,
            mut commands,
        } = self;

        session
            .relay
            .join(&session.room_id)
            .with_context(|| format!("joining room {}", session.room_id))?;

        loop {
            let sending = session.sending.is_some() && !session.awaiting_drain;
            let reconnect_at = session.reconnect_at;
            let reconnect_deadline = reconnect_at.unwrap_or_else(time::Instant::now);

            let flow = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => session.on_rendezvous(event),
                    None => {
                        warn!("Relay connection closed");
                        session.apply(ConnectionEvent::Leave);
                        return Err(ClientError::RelayClosed.into());
                    }
                },
                Some(notice) = link_notices.recv() => {
                    session.on_link_notice(notice);
                    Flow::Continue
                }
                command = commands.recv() => {
                    session.on_command(command.unwrap_or(SessionCommand::Leave))
                }
                _ = time::sleep_until(reconnect_deadline), if reconnect_at.is_some() => {
                    session.reconnect_at = None;
                    session.apply(ConnectionEvent::ReconnectDue);
                    Flow::Continue
                }
                _ = task::yield_now(), if sending => {
                    session.send_step();
                    Flow::Continue
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        info!("Session in room {} ended", session.room_id);
        Ok(())
    }
}

struct Session<F: LinkFactory> {
    room_id: String,
    peer_id: Option<PeerId>,
    config: TransferConfig,
    machine: ConnectionMachine<F>,
    receiver: TransferReceiver,
    sending: Option<TransferSender>,
    awaiting_drain: bool,
    gate: ConsentGate,
    inbox: ConsentInbox,
    relay: RendezvousClient,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    reconnect_at: Option<time::Instant>,
    logger: Arc<dyn TransferLogger>,
}

impl<F: LinkFactory> Session<F> {
    fn notify(&self, update: SessionUpdate) {
        // The host may stop listening; the session keeps running regardless.
        let _ = self.updates.send(update);
    }

    fn on_rendezvous(&mut self, event: RendezvousEvent) -> Flow {
        match event {
            RendezvousEvent::Ready { peer_id } => {
                debug!("Relay assigned id {}", peer_id);
                self.peer_id = Some(peer_id);
                self.notify(SessionUpdate::Ready { peer_id });
            }
            RendezvousEvent::RoomUsers { room_id, users } => {
                let existing: Vec<PeerId> = users
                    .into_iter()
                    .filter(|u| Some(*u) != self.peer_id)
                    .collect();
                debug!("Room {} snapshot: {} other member(s)", room_id, existing.len());
                self.apply(ConnectionEvent::MembershipSnapshot { existing });
            }
            RendezvousEvent::UserConnected { user_id } => {
                if Some(user_id) != self.peer_id {
                    self.apply(ConnectionEvent::MemberJoined(user_id));
                }
            }
            RendezvousEvent::UserDisconnected { user_id } => {
                self.inbox.forget(user_id);
                if self.machine.remote() == Some(user_id)
                    && let Some(offer) = self.gate.pending()
                {
                    let transfer_id = offer.transfer_id;
                    self.gate.clear();
                    self.notify(SessionUpdate::SendFailed {
                        transfer_id: Some(transfer_id),
                        error: TransferError::NotConnected,
                    });
                }
                self.apply(ConnectionEvent::MemberLeft(user_id));
            }
            RendezvousEvent::Signal { from, signal } => {
                self.apply(ConnectionEvent::SignalReceived { from, signal });
            }
            RendezvousEvent::RoomFull { room_id } => {
                warn!("Room {} is full", room_id);
                self.notify(SessionUpdate::RoomFull { room_id });
                return Flow::Stop;
            }
            RendezvousEvent::TransferRequest {
                from,
                transfer_id,
                metadata,
            } => {
                info!("{} asks to send {:?} ({} bytes)", from, metadata.name, metadata.size);
                let request = InboundRequest {
                    from,
                    transfer_id,
                    metadata,
                };
                self.inbox.receive(request.clone());
                self.notify(SessionUpdate::ConsentRequested(request));
            }
            RendezvousEvent::TransferAccepted { from, transfer_id } => {
                if let Some(offer) = self.gate.on_accepted(transfer_id) {
                    info!("{} accepted {}", from, transfer_id);
                    self.start_send(offer.transfer_id, offer.name, offer.data);
                }
            }
            RendezvousEvent::TransferRejected {
                from,
                transfer_id,
                reason,
            } => {
                if let Some(error) = self.gate.on_rejected(transfer_id, &reason) {
                    info!("{} rejected {}: {}", from, transfer_id, reason);
                    self.notify(SessionUpdate::SendFailed {
                        transfer_id: Some(transfer_id),
                        error,
                    });
                }
            }
        }
        Flow::Continue
    }

    fn on_link_notice(&mut self, notice: LinkNotice) {
        let LinkNotice { link, event } = notice;
        match event {
            LinkEvent::Signal(signal) => self.apply(ConnectionEvent::LinkSignal(link, signal)),
            LinkEvent::Connected => self.apply(ConnectionEvent::LinkConnected(link)),
            LinkEvent::Error(e) => self.apply(ConnectionEvent::LinkError(link, e)),
            LinkEvent::Closed => self.apply(ConnectionEvent::LinkClosed(link)),
            LinkEvent::Data(frame) => {
                if self.machine.link_id() == Some(link) {
                    self.on_frame(frame);
                } else {
                    debug!("Dropping {} bytes from stale {}", frame.len(), link);
                }
            }
            LinkEvent::Drained => {
                if self.machine.link_id() == Some(link) {
                    self.awaiting_drain = false;
                }
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::SendFile { name, data } => self.offer_file(name, data),
            SessionCommand::CancelSend => {
                if let Some(sender) = &self.sending {
                    sender.cancel();
                    self.awaiting_drain = false;
                } else if let Some(offer) = self.gate.pending() {
                    let transfer_id = offer.transfer_id;
                    self.gate.clear();
                    self.notify(SessionUpdate::SendCancelled { transfer_id });
                }
            }
            SessionCommand::Decide {
                transfer_id,
                accept,
                reason,
            } => {
                let sent = match self.inbox.decide(transfer_id, accept, reason) {
                    Some(ConsentDecision::Accept { to, transfer_id }) => {
                        self.relay.send_transfer_decision(to, transfer_id, true, None)
                    }
                    Some(ConsentDecision::Reject {
                        to,
                        transfer_id,
                        reason,
                    }) => self.relay.send_transfer_decision(to, transfer_id, false, Some(reason)),
                    None => {
                        debug!("No pending request {}", transfer_id);
                        Ok(())
                    }
                };
                if let Err(e) = sent {
                    warn!("Decision on {} not sent: {}", transfer_id, e);
                }
            }
            SessionCommand::Leave => {
                self.apply(ConnectionEvent::Leave);
                if let Err(e) = self.relay.leave() {
                    debug!("Leave not sent: {}", e);
                }
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn offer_file(&mut self, name: String, data: Bytes) {
        if self.machine.state() != ConnectionState::Connected {
            self.fail_send(None, TransferError::NotConnected);
            return;
        }
        if self.sending.is_some() {
            self.fail_send(None, TransferError::TransferInProgress);
            return;
        }
        if !self.config.require_consent {
            self.start_send(Uuid::new_v4(), name, data);
            return;
        }

        let (transfer_id, metadata) = match self.gate.offer(name, data) {
            Ok(offer) => (offer.transfer_id, offer.metadata()),
            Err(e) => {
                self.fail_send(None, e);
                return;
            }
        };
        if let Err(e) = self
            .relay
            .send_transfer_request(self.machine.remote(), transfer_id, metadata.clone())
        {
            warn!("Transfer request {} not sent: {}", transfer_id, e);
            self.gate.clear();
            self.fail_send(Some(transfer_id), TransferError::NotConnected);
            return;
        }
        self.notify(SessionUpdate::AwaitingConsent {
            transfer_id,
            metadata,
        });
    }

    fn start_send(&mut self, transfer_id: Uuid, name: String, data: Bytes) {
        if self.machine.state() != ConnectionState::Connected {
            self.fail_send(Some(transfer_id), TransferError::NotConnected);
            return;
        }
        if self.sending.is_some() {
            self.fail_send(Some(transfer_id), TransferError::TransferInProgress);
            return;
        }
        match TransferSender::new(transfer_id, name, data, &self.config, self.logger.clone()) {
            Ok(sender) => {
                self.sending = Some(sender);
                self.awaiting_drain = false;
            }
            Err(e) => self.fail_send(Some(transfer_id), e),
        }
    }

    fn send_step(&mut self) {
        let Some(sender) = self.sending.as_mut() else {
            return;
        };
        let transfer_id = sender.transfer_id();
        let Some(link) = self.machine.connected_link() else {
            self.sending = None;
            self.fail_send(Some(transfer_id), TransferError::NotConnected);
            return;
        };

        let result = sender.step(link, Instant::now());
        let progress = sender.progress();
        match result {
            Ok(SendStep::Continue) => {
                self.notify(SessionUpdate::SendProgress { transfer_id, progress });
            }
            Ok(SendStep::AwaitDrain) => {
                self.awaiting_drain = true;
                self.notify(SessionUpdate::SendProgress { transfer_id, progress });
            }
            Ok(SendStep::Complete) => {
                self.sending = None;
                self.notify(SessionUpdate::SendProgress { transfer_id, progress });
                self.notify(SessionUpdate::SendComplete { transfer_id });
            }
            Ok(SendStep::Cancelled) => {
                self.sending = None;
                self.notify(SessionUpdate::SendCancelled { transfer_id });
            }
            Err(e) => {
                self.sending = None;
                self.fail_send(Some(transfer_id), e);
            }
        }
    }

    fn fail_send(&self, transfer_id: Option<Uuid>, error: TransferError) {
        warn!("Send failed: {}", error);
        self.notify(SessionUpdate::SendFailed { transfer_id, error });
    }

    fn on_frame(&mut self, frame: Bytes) {
        let update = match self.receiver.on_frame(frame, Instant::now()) {
            ReceiveOutcome::Started { metadata, superseded } => {
                if let Some(violation) = superseded {
                    self.notify(SessionUpdate::ProtocolViolation(violation));
                }
                SessionUpdate::ReceiveStarted(metadata)
            }
            ReceiveOutcome::Progress(progress) => SessionUpdate::ReceiveProgress(progress),
            ReceiveOutcome::Complete(artifact) => {
                self.notify(SessionUpdate::ReceiveProgress(TransferProgress {
                    transferred: artifact.size(),
                    total: artifact.size(),
                    bytes_per_sec: 0.0,
                }));
                info!(
                    "Received {} ({} bytes, sha256 {})",
                    artifact.file_name,
                    artifact.size(),
                    artifact.sha256
                );
                SessionUpdate::Received(artifact)
            }
            ReceiveOutcome::Aborted { file_name, received } => {
                SessionUpdate::ReceiveAborted { file_name, received }
            }
            ReceiveOutcome::Ignored(violation) => SessionUpdate::ProtocolViolation(violation),
        };
        self.notify(update);
    }

    fn apply(&mut self, event: ConnectionEvent) {
        for action in self.machine.handle(event) {
            match action {
                ConnectionAction::SendSignal(signal) => {
                    if let Err(e) = self.relay.send_signal(self.machine.remote(), signal) {
                        warn!("Signal not relayed: {}", e);
                    }
                }
                ConnectionAction::ScheduleReconnect { delay, attempt } => {
                    info!("Reconnect attempt {} in {:?}", attempt, delay);
                    self.reconnect_at = Some(time::Instant::now() + delay);
                }
                ConnectionAction::StateChanged(state) => {
                    match state {
                        ConnectionState::Failed => {
                            error!("Link to room {} failed for good", self.room_id);
                            self.reconnect_at = None;
                        }
                        ConnectionState::Connected | ConnectionState::Disconnected => {
                            self.reconnect_at = None
                        }
                        _ => {}
                    }
                    self.notify(SessionUpdate::State(state));
                }
                ConnectionAction::LinkLost => {
                    if let Some(metadata) = self.receiver.on_link_lost() {
                        self.notify(SessionUpdate::ReceiveDiscarded(metadata));
                    }
                    self.awaiting_drain = false;
                    if let Some(sender) = self.sending.take() {
                        self.fail_send(
                            Some(sender.transfer_id()),
                            TransferError::Link(LinkError::Closed),
                        );
                    }
                }
            }
        }
    }
}
