use std::fmt;
use std::time::Duration;

use tether_types::{PeerId, SignalPayload};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{LinkError, SignalingError};
use crate::link::{LinkFactory, LinkId, PeerLink, Role};
use crate::reconciler::SignalReconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Signaling,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Signaling => "signaling",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Members already present when this participant joined (self excluded)
    MembershipSnapshot { existing: Vec<PeerId> },
    MemberJoined(PeerId),
    MemberLeft(PeerId),
    /// Negotiation payload relayed from a room member
    SignalReceived { from: PeerId, signal: SignalPayload },
    /// Local negotiation payload produced by a link
    LinkSignal(LinkId, SignalPayload),
    LinkConnected(LinkId),
    LinkError(LinkId, LinkError),
    LinkClosed(LinkId),
    /// A previously scheduled reconnect delay elapsed
    ReconnectDue,
    /// Host asked to leave the session
    Leave,
}

/// Work the host must carry out on the machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Relay this payload to the remote peer
    SendSignal(SignalPayload),
    /// Feed `ConnectionEvent::ReconnectDue` back after `delay`
    ScheduleReconnect { delay: Duration, attempt: u32 },
    StateChanged(ConnectionState),
    /// The link was torn down; in-flight transfers over it are void
    LinkLost,
}

/// Drives one participant's side of a pairing.
///
/// Pure state machine: every input goes through [`handle`](Self::handle)
/// and comes back as a list of actions. The machine owns the current link
/// and tears it down before creating a replacement.
pub struct ConnectionMachine<F: LinkFactory> {
    config: ConnectionConfig,
    factory: F,
    state: ConnectionState,
    role: Option<Role>,
    remote: Option<PeerId>,
    link: Option<F::Link>,
    next_link: u64,
    reconciler: SignalReconciler,
    failures: u32,
}

impl<F: LinkFactory> ConnectionMachine<F> {
    pub fn new(factory: F, config: ConnectionConfig) -> Self {
        Self {
            config,
            factory,
            state: ConnectionState::Disconnected,
            role: None,
            remote: None,
            link: None,
            next_link: 1,
            reconciler: SignalReconciler::new(),
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote(&self) -> Option<PeerId> {
        self.remote
    }

    /// Consecutive link failures since the last successful connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn link_id(&self) -> Option<LinkId> {
        self.link.as_ref().map(|link| link.id())
    }

    /// The link, but only once it is connected.
    pub fn connected_link(&mut self) -> Option<&mut F::Link> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.link.as_mut()
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        match event {
            ConnectionEvent::MembershipSnapshot { existing } => {
                self.on_snapshot(existing, &mut actions)
            }
            ConnectionEvent::MemberJoined(peer) => self.on_member_joined(peer, &mut actions),
            ConnectionEvent::MemberLeft(peer) => self.on_member_left(peer, &mut actions),
            ConnectionEvent::SignalReceived { from, signal } => {
                self.on_remote_signal(from, signal, &mut actions)
            }
            ConnectionEvent::LinkSignal(id, signal) => {
                if self.is_current(id) {
                    actions.push(ConnectionAction::SendSignal(signal));
                } else {
                    debug!("Dropping signal from stale {}", id);
                }
            }
            ConnectionEvent::LinkConnected(id) => self.on_link_connected(id, &mut actions),
            ConnectionEvent::LinkError(id, err) => {
                if !self.is_current(id) {
                    debug!("Ignoring error from stale {}: {}", id, err);
                    return actions;
                }
                match self.state {
                    ConnectionState::Connected => warn!("{} error while connected: {}", id, err),
                    ConnectionState::Connecting => {
                        warn!("{} failed while connecting: {}", id, err);
                        self.on_failure(&mut actions);
                    }
                    _ => {}
                }
            }
            ConnectionEvent::LinkClosed(id) => {
                if !self.is_current(id) {
                    debug!("Ignoring close of stale {}", id);
                    return actions;
                }
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    info!("{} closed", id);
                    self.on_failure(&mut actions);
                }
            }
            ConnectionEvent::ReconnectDue => {
                if self.state != ConnectionState::Reconnecting {
                    debug!("Reconnect timer fired in state {}, ignoring", self.state);
                    return actions;
                }
                if let Some(role) = self.role {
                    self.open_link(role, &mut actions);
                }
            }
            ConnectionEvent::Leave => {
                if self.teardown() {
                    actions.push(ConnectionAction::LinkLost);
                }
                self.role = None;
                self.remote = None;
                self.failures = 0;
                self.set_state(ConnectionState::Disconnected, &mut actions);
            }
        }
        actions
    }

    fn on_snapshot(&mut self, existing: Vec<PeerId>, actions: &mut Vec<ConnectionAction>) {
        if self.state != ConnectionState::Disconnected {
            warn!("Membership snapshot ignored in state {}", self.state);
            return;
        }
        if existing.len() > 1 {
            warn!("Room already holds {} members, pairing with the first", existing.len());
        }

        let role = if existing.is_empty() {
            Role::Initiator
        } else {
            Role::Responder
        };
        info!("Joined room as {:?} ({} existing members)", role, existing.len());
        self.role = Some(role);
        self.remote = existing.first().copied();
        self.failures = 0;
        self.set_state(ConnectionState::Signaling, actions);
    }

    fn on_member_joined(&mut self, peer: PeerId, actions: &mut Vec<ConnectionAction>) {
        if self.state != ConnectionState::Signaling {
            debug!("Member {} joined in state {}, ignoring", peer, self.state);
            return;
        }
        if let Some(remote) = self.remote
            && remote != peer
        {
            warn!("Member {} joined but already paired with {}", peer, remote);
            return;
        }

        self.remote = Some(peer);
        if self.role == Some(Role::Initiator) {
            info!("Peer {} joined, opening link", peer);
            self.open_link(Role::Initiator, actions);
        }
    }

    fn on_member_left(&mut self, peer: PeerId, actions: &mut Vec<ConnectionAction>) {
        if self.remote != Some(peer) {
            debug!("Non-paired member {} left", peer);
            return;
        }

        info!("Peer {} left", peer);
        self.remote = None;
        self.failures = 0;
        if self.teardown() {
            actions.push(ConnectionAction::LinkLost);
        }
        if !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            // Sole member now, so the next arrival is answered by us.
            self.role = Some(Role::Initiator);
            self.set_state(ConnectionState::Signaling, actions);
        }
    }

    fn on_remote_signal(
        &mut self,
        from: PeerId,
        signal: SignalPayload,
        actions: &mut Vec<ConnectionAction>,
    ) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            warn!("{}", SignalingError::NoSession);
            return;
        }
        match self.remote {
            Some(remote) if remote != from => {
                warn!("{}", SignalingError::UnknownSender(from.to_string()));
                return;
            }
            Some(_) => {}
            None => self.remote = Some(from),
        }

        if self.link.is_none() {
            if self.role == Some(Role::Initiator) {
                debug!("No link yet, initiator drops signal from {}", from);
                return;
            }
            self.open_link(Role::Responder, actions);
        }

        let ready = self.reconciler.admit(signal);
        let Some(link) = self.link.as_mut() else {
            return;
        };
        for signal in ready {
            if let Err(e) = link.apply_signal(&signal) {
                warn!("{} rejected signal: {}", link.id(), e);
            }
        }
    }

    fn on_link_connected(&mut self, id: LinkId, actions: &mut Vec<ConnectionAction>) {
        if !self.is_current(id) {
            debug!("Ignoring connect of stale {}", id);
            return;
        }
        if self.state != ConnectionState::Connecting {
            debug!("{} connected in state {}, ignoring", id, self.state);
            return;
        }

        let dropped = self.reconciler.discard_pending();
        if dropped > 0 {
            warn!("{} connected with {} unapplied candidates", id, dropped);
        }
        self.failures = 0;
        self.set_state(ConnectionState::Connected, actions);
    }

    /// Tear down the link and either schedule a retry or give up.
    fn on_failure(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.teardown() {
            actions.push(ConnectionAction::LinkLost);
        }
        self.failures += 1;
        if self.failures < self.config.max_reconnects {
            info!(
                "Link failure {}/{}, retrying in {:?}",
                self.failures, self.config.max_reconnects, self.config.reconnect_delay
            );
            self.set_state(ConnectionState::Reconnecting, actions);
            actions.push(ConnectionAction::ScheduleReconnect {
                delay: self.config.reconnect_delay,
                attempt: self.failures,
            });
        } else {
            warn!("Giving up after {} consecutive link failures", self.failures);
            self.set_state(ConnectionState::Failed, actions);
        }
    }

    fn open_link(&mut self, role: Role, actions: &mut Vec<ConnectionAction>) {
        if self.teardown() {
            actions.push(ConnectionAction::LinkLost);
        }
        let id = LinkId(self.next_link);
        self.next_link += 1;

        match self.factory.create(id, role) {
            Ok(link) => {
                debug!("Created {} as {:?}", id, role);
                self.link = Some(link);
                self.set_state(ConnectionState::Connecting, actions);
            }
            Err(e) => {
                warn!("Could not create {}: {}", id, e);
                self.on_failure(actions);
            }
        }
    }

    /// Destroy the current link, if any. Returns whether one existed.
    fn teardown(&mut self) -> bool {
        self.reconciler.reset();
        match self.link.take() {
            Some(mut link) => {
                link.destroy();
                true
            }
            None => false,
        }
    }

    fn is_current(&self, id: LinkId) -> bool {
        self.link_id() == Some(id)
    }

    fn set_state(&mut self, next: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state == next {
            return;
        }
        info!("Connection {} -> {}", self.state, next);
        self.state = next;
        actions.push(ConnectionAction::StateChanged(next));
    }
}

impl<F: LinkFactory> Drop for ConnectionMachine<F> {
    fn drop(&mut self) {
        self.teardown();
    }
}
