//! Peer session: the client-side negotiation state machine.
//!
//! ```text
//!   Idle ──Dial──► Dialing ──answer──► Connected ◄──reconnect── Recovering
//!    ▲               │                    │  ▲                       │
//!    │   timeout /   │                    │  └──── disconnected ─────┘
//!    ├─ not found / ─┘                    │
//!    │   failure                          │ end / remote disconnect /
//!    └────────────────────────────────────┘ failed / grace expired
//!
//!   Idle ──offer──► Connected (as responder)
//! ```
//!
//! The session is a single task ([`PeerSession::run`]) draining one input
//! queue. Host commands, relay frames, transport events and timer expiries
//! all arrive there, so no state is shared. It owns at most one *pending*
//! attempt (dialing) and one *active* attempt (connected); every event is
//! tagged with the [`AttemptId`] it belongs to and dropped when that
//! attempt is gone.
//!
//! Glare: when an offer arrives from the peer we are dialing, the side with
//! the greater local id keeps its dial and ignores the offer; the other side
//! abandons its dial and answers. Both ends converge on a single pair.

mod attempt;
pub mod candidates;

pub use attempt::AttemptId;

use crate::core::config::{
    ALERT_TIMEOUT, DIAL_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_STALE_AFTER, RECOVERY_GRACE,
};
use crate::core::connection::signaling::RelayLink;
use crate::core::connection::{LinkState, Role, TransportEvent, TransportFactory};
use crate::core::error::{Alert, ProtocolError, SessionError, TransferError};
use crate::core::pipeline::batch::FileRef;
use crate::core::pipeline::receiver::BatchReceiver;
use crate::core::pipeline::sender::BatchSender;
use crate::core::pipeline::{TransferConfig, TransferEvent};
use crate::core::protocol::control::{ChannelMessage, ControlMessage, Inbound};
use crate::core::protocol::relay::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use anyhow::Result;
use attempt::Attempt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub dial_timeout: Duration,
    pub recovery_grace: Duration,
    /// `Duration::ZERO` disables the ping/pong heartbeat.
    pub heartbeat_interval: Duration,
    pub heartbeat_stale_after: Duration,
    pub alert_timeout: Duration,
    pub transfer: TransferConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
            recovery_grace: RECOVERY_GRACE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_stale_after: HEARTBEAT_STALE_AFTER,
            alert_timeout: ALERT_TIMEOUT,
            transfer: TransferConfig::default(),
        }
    }
}

// ── Public surface ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dialing,
    Connected,
    Recovering,
}

/// Host-facing status, emitted on every transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// The relay assigned our id.
    Ready { local_id: String },
    Idle,
    Waiting { remote: String },
    Connected { remote: String },
    Recovering { remote: String },
    Error(Alert),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(SessionStatus),
    Transfer(TransferEvent),
    Chat { from: String, text: String },
}

pub(crate) enum SessionInput {
    Dial(String),
    End,
    SendBatch(Vec<FileRef>),
    TogglePause,
    StopTransfer,
    Signal(ServerMessage),
    Transport {
        attempt: AttemptId,
        event: TransportEvent,
    },
    DialTimeout(AttemptId),
    RecoveryExpired(AttemptId),
    HeartbeatTick(AttemptId),
    RelayLost,
    Shutdown,
}

/// Cloneable command side of a running [`PeerSession`].
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    fn send(&self, input: SessionInput) {
        if self.inputs.send(input).is_err() {
            debug!("session is gone, command dropped");
        }
    }

    pub fn dial(&self, remote: impl Into<String>) {
        self.send(SessionInput::Dial(remote.into()));
    }

    pub fn end(&self) {
        self.send(SessionInput::End);
    }

    pub fn send_files(&self, files: Vec<FileRef>) {
        self.send(SessionInput::SendBatch(files));
    }

    pub fn toggle_pause(&self) {
        self.send(SessionInput::TogglePause);
    }

    pub fn stop_transfer(&self) {
        self.send(SessionInput::StopTransfer);
    }

    pub fn shutdown(&self) {
        self.send(SessionInput::Shutdown);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `want`.
    pub async fn wait_for(&mut self, want: SessionState) -> bool {
        self.state.wait_for(|s| *s == want).await.is_ok()
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct PeerSession {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    relay: mpsc::UnboundedSender<ClientMessage>,
    relay_inbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    events: mpsc::UnboundedSender<SessionEvent>,

    inputs_tx: mpsc::UnboundedSender<SessionInput>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    state_tx: watch::Sender<SessionState>,

    local_id: Option<String>,
    next_attempt: u64,
    pending: Option<Attempt>,
    active: Option<Attempt>,

    sender: BatchSender,
    receiver: BatchReceiver,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
    transfer_rx: Option<mpsc::UnboundedReceiver<TransferEvent>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Active,
}

impl PeerSession {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        relay: RelayLink,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            inputs: inputs_tx.clone(),
            state: state_rx,
        };
        let session = Self {
            sender: BatchSender::new(config.transfer.clone(), transfer_tx.clone()),
            receiver: BatchReceiver::new(config.transfer.clone(), transfer_tx.clone()),
            config,
            factory,
            relay: relay.outbound,
            relay_inbound: Some(relay.inbound),
            events,
            inputs_tx,
            inputs,
            state_tx,
            local_id: None,
            next_attempt: 0,
            pending: None,
            active: None,
            transfer_tx,
            transfer_rx: Some(transfer_rx),
        };
        (session, handle)
    }

    /// Drive the session until [`SessionHandle::shutdown`].
    pub async fn run(mut self) {
        if let Some(mut inbound) = self.relay_inbound.take() {
            let inputs = self.inputs_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = inbound.recv().await {
                    if inputs.send(SessionInput::Signal(msg)).is_err() {
                        return;
                    }
                }
                warn!(event = "relay_lost", "Relay link closed");
                let _ = inputs.send(SessionInput::RelayLost);
            });
        }
        if let Some(mut transfers) = self.transfer_rx.take() {
            let events = self.events.clone();
            tokio::spawn(async move {
                while let Some(ev) = transfers.recv().await {
                    if events.send(SessionEvent::Transfer(ev)).is_err() {
                        return;
                    }
                }
            });
        }

        while let Some(input) = self.inputs.recv().await {
            if let SessionInput::Shutdown = input {
                self.drop_pending(None).await;
                self.teardown_active(true, "shutdown").await;
                self.publish_state();
                break;
            }
            self.handle(input).await;
            self.publish_state();
        }
        debug!("session stopped");
    }

    async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Dial(remote) => self.dial(remote).await,
            SessionInput::End => self.end().await,
            SessionInput::SendBatch(files) => self.start_batch(files),
            SessionInput::TogglePause => {
                self.sender.toggle_pause();
            }
            SessionInput::StopTransfer => {
                if !self.sender.stop() {
                    debug!("stop requested with no batch running");
                }
            }
            SessionInput::Signal(msg) => self.on_signal(msg).await,
            SessionInput::Transport { attempt, event } => self.on_transport(attempt, event).await,
            SessionInput::DialTimeout(id) => {
                if self.pending.as_ref().is_some_and(|p| p.id == id) {
                    self.drop_pending(Some(SessionError::DialTimeout)).await;
                }
            }
            SessionInput::RecoveryExpired(id) => {
                if self.active.as_ref().is_some_and(|a| a.id == id && a.recovering) {
                    warn!(event = "recovery_expired", attempt = %id, "Connection did not recover");
                    self.teardown_active(false, "recovery expired").await;
                }
            }
            SessionInput::HeartbeatTick(id) => self.on_heartbeat(id).await,
            SessionInput::RelayLost => {
                self.drop_pending(Some(SessionError::Signaling("relay connection lost".into())))
                    .await;
            }
            SessionInput::Shutdown => {}
        }
    }

    // ── State helpers ────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        if self.pending.is_some() {
            SessionState::Dialing
        } else {
            match &self.active {
                Some(a) if a.recovering => SessionState::Recovering,
                Some(_) => SessionState::Connected,
                None => SessionState::Idle,
            }
        }
    }

    fn publish_state(&self) {
        let state = self.state();
        self.state_tx.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        });
    }

    fn emit(&self, status: SessionStatus) {
        let _ = self.events.send(SessionEvent::Status(status));
    }

    fn emit_error(&self, error: SessionError) {
        self.emit(SessionStatus::Error(Alert {
            error,
            expires_in: self.config.alert_timeout,
        }));
    }

    /// Queue a frame for the relay; `false` when the link is gone.
    fn signal(&self, msg: ClientMessage) -> bool {
        let delivered = self.relay.send(msg).is_ok();
        if !delivered {
            warn!(event = "relay_send_failure", "Relay link is closed");
        }
        delivered
    }

    /// Re-announce the live session after a side dial was abandoned.
    fn announce_active(&self) {
        if let Some(active) = &self.active {
            self.emit(SessionStatus::Connected {
                remote: active.remote.clone(),
            });
        }
    }

    fn slot_of(&self, id: AttemptId) -> Option<Slot> {
        if self.pending.as_ref().is_some_and(|a| a.id == id) {
            Some(Slot::Pending)
        } else if self.active.as_ref().is_some_and(|a| a.id == id) {
            Some(Slot::Active)
        } else {
            None
        }
    }

    fn attempt_mut(&mut self, slot: Slot) -> Option<&mut Attempt> {
        match slot {
            Slot::Pending => self.pending.as_mut(),
            Slot::Active => self.active.as_mut(),
        }
    }

    fn spawn_timer(&self, after: Duration, input: SessionInput) -> JoinHandle<()> {
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(input);
        })
    }

    async fn new_attempt(&mut self, role: Role, remote: String) -> Result<Attempt> {
        self.next_attempt += 1;
        let id = AttemptId(self.next_attempt);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(role, tx).await?;

        let inputs = self.inputs_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if inputs.send(SessionInput::Transport { attempt: id, event }).is_err() {
                    return;
                }
            }
        });
        Ok(Attempt::new(id, role, remote, transport, forwarder))
    }

    fn validate_remote(&self, remote: &str) -> Result<(), SessionError> {
        let valid = !remote.is_empty()
            && remote
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SessionError::InvalidPeerId);
        }
        if self.local_id.as_deref() == Some(remote) {
            return Err(SessionError::SelfDial);
        }
        if self.active.as_ref().is_some_and(|a| a.remote == remote) {
            return Err(SessionError::AlreadyConnected);
        }
        Ok(())
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    async fn dial(&mut self, remote: String) {
        if let Err(e) = self.validate_remote(&remote) {
            info!(event = "dial_rejected", remote = %remote, error = %e);
            self.emit_error(e);
            return;
        }

        self.signal(ClientMessage::ConnectionAttempt);
        if self.pending.is_some() {
            self.drop_pending(None).await;
        }

        let attempt = match self.new_attempt(Role::Initiator, remote.clone()).await {
            Ok(a) => a,
            Err(e) => {
                warn!(event = "transport_create_failure", error = %e);
                self.signal(ClientMessage::ConnectionUserFailed);
                self.emit_error(SessionError::NegotiationFailed);
                return;
            }
        };
        let id = attempt.id;
        self.pending = Some(attempt);

        let offer = match self.pending_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(event = "offer_failure", attempt = %id, error = %e);
                self.drop_pending(Some(SessionError::NegotiationFailed)).await;
                return;
            }
        };

        let timer = self.spawn_timer(self.config.dial_timeout, SessionInput::DialTimeout(id));
        if let Some(p) = self.pending.as_mut() {
            p.arm_timer(timer);
        }
        let sent = self.signal(ClientMessage::Offer {
            target: remote.clone(),
            sdp: offer,
        });
        if !sent {
            self.drop_pending(Some(SessionError::Signaling("offer not delivered".into())))
                .await;
            return;
        }
        info!(event = "dial_started", attempt = %id, remote = %remote, "Dialing peer");
        self.emit(SessionStatus::Waiting { remote });
    }

    async fn pending_offer(&self) -> Result<SessionDescription> {
        match &self.pending {
            Some(p) => p.transport.create_offer().await,
            None => anyhow::bail!("no pending attempt"),
        }
    }

    async fn end(&mut self) {
        if self.pending.is_some() {
            info!(event = "dial_cancelled", "Dial cancelled by user");
            self.drop_pending(None).await;
            if self.active.is_none() {
                self.emit(SessionStatus::Idle);
            } else {
                self.announce_active();
            }
            return;
        }
        self.teardown_active(true, "local end").await;
    }

    fn start_batch(&mut self, files: Vec<FileRef>) {
        let Some(channel) = self.active.as_ref().and_then(|a| a.open_channel().cloned()) else {
            warn!(event = "send_rejected", "No open data channel");
            let _ = self
                .transfer_tx
                .send(TransferEvent::SendFailed(TransferError::ChannelNotOpen.to_string()));
            return;
        };

        let sender = self.sender.clone();
        let events = self.transfer_tx.clone();
        tokio::spawn(async move {
            match sender.send_batch(channel, files).await {
                Ok(outcome) => debug!(?outcome, "batch task finished"),
                Err(e @ (TransferError::EmptyBatch
                | TransferError::ChannelNotOpen
                | TransferError::Busy)) => {
                    warn!(event = "send_rejected", error = %e);
                    let _ = events.send(TransferEvent::SendFailed(e.to_string()));
                }
                Err(e) => debug!(error = %e, "batch task failed"),
            }
        });
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Abandon the pending attempt. Every abandoned attempt is reported to
    /// the relay as a failed one.
    async fn drop_pending(&mut self, error: Option<SessionError>) {
        let Some(attempt) = self.pending.take() else { return };
        self.signal(ClientMessage::ConnectionUserFailed);
        match &error {
            Some(e) => warn!(
                event = "dial_failed",
                attempt = %attempt.id,
                remote = %attempt.remote,
                kind = ?e.kind(),
                error = %e,
                "Dial failed"
            ),
            None => debug!(attempt = %attempt.id, remote = %attempt.remote, "dial abandoned"),
        }
        attempt.close(false).await;
        if let Some(e) = error {
            self.emit_error(e);
            self.announce_active();
        }
    }

    /// End the active attempt and tell the host the session is idle.
    async fn teardown_active(&mut self, notify: bool, reason: &str) {
        if self.close_active(notify, reason).await && self.pending.is_none() {
            self.emit(SessionStatus::Idle);
        }
    }

    /// End the active attempt without a status; used when another attempt
    /// takes its place. Returns whether there was one.
    async fn close_active(&mut self, notify: bool, reason: &str) -> bool {
        let Some(attempt) = self.active.take() else { return false };
        self.sender.abort();
        self.receiver.reset();
        info!(
            event = "session_ended",
            attempt = %attempt.id,
            remote = %attempt.remote,
            reason,
            "Session ended"
        );
        attempt.close(notify).await;
        true
    }

    // ── Relay frames ─────────────────────────────────────────────────────────

    async fn on_signal(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Welcome { id } => {
                info!(event = "relay_welcome", local_id = %id, "Registered with relay");
                self.local_id = Some(id.clone());
                self.emit(SessionStatus::Ready { local_id: id });
            }
            ServerMessage::Offer { sdp, caller } => self.on_offer(sdp, caller).await,
            ServerMessage::Answer { sdp, callee } => self.on_answer(sdp, callee).await,
            ServerMessage::Candidate { candidate, from } => self.on_candidate(candidate, from).await,
            ServerMessage::PeerNotFound { target } => self.on_peer_not_found(target).await,
        }
    }

    async fn on_offer(&mut self, sdp: SessionDescription, caller: String) {
        if let Some(p) = &self.pending {
            let keep_dial = p.remote == caller
                && self
                    .local_id
                    .as_deref()
                    .is_some_and(|local| local > caller.as_str());
            if keep_dial {
                info!(event = "glare_kept_dial", remote = %caller, "Ignoring crossing offer");
                return;
            }
            info!(event = "glare_yield", remote = %caller, dialing = %p.remote, "Inbound offer preempts dial");
            self.drop_pending(None).await;
        }
        let replaced = self.close_active(true, "preempted by inbound offer").await;

        let mut attempt = match self.new_attempt(Role::Responder, caller.clone()).await {
            Ok(a) => a,
            Err(e) => {
                warn!(event = "transport_create_failure", error = %e);
                self.fail_offer(SessionError::NegotiationFailed, replaced);
                return;
            }
        };
        let answer = match attempt.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(event = "answer_failure", attempt = %attempt.id, remote = %caller, error = %e);
                attempt.close(false).await;
                self.fail_offer(SessionError::NegotiationFailed, replaced);
                return;
            }
        };

        let sent = self.signal(ClientMessage::Answer {
            target: caller.clone(),
            sdp: answer,
        });
        if !sent {
            attempt.close(false).await;
            self.fail_offer(SessionError::Signaling("answer not delivered".into()), replaced);
            return;
        }
        info!(event = "offer_answered", attempt = %attempt.id, remote = %caller, "Answered offer");
        self.active = Some(attempt);
    }

    fn fail_offer(&self, error: SessionError, replaced: bool) {
        self.emit_error(error);
        if replaced {
            self.emit(SessionStatus::Idle);
        }
    }

    async fn on_answer(&mut self, sdp: SessionDescription, callee: String) {
        let Some(pending) = self.pending.as_mut().filter(|p| p.remote == callee) else {
            debug!(remote = %callee, "stale answer ignored");
            return;
        };
        if let Err(e) = pending.apply_remote(sdp).await {
            warn!(event = "answer_apply_failure", remote = %callee, error = %e);
            self.drop_pending(Some(SessionError::NegotiationFailed)).await;
            return;
        }
        pending.disarm_timer();
        pending.answered_at = Some(Instant::now());

        let Some(attempt) = self.pending.take() else { return };
        self.close_active(true, "replaced by new connection").await;
        self.signal(ClientMessage::ConnectionSuccess);
        info!(event = "answer_applied", attempt = %attempt.id, remote = %callee, "Answer applied");

        let channel_ready = attempt.open_channel().is_some();
        self.active = Some(attempt);
        if channel_ready {
            self.on_channel_ready();
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate, from: String) {
        let slot = if self.pending.as_ref().is_some_and(|p| p.remote == from) {
            Slot::Pending
        } else if self.active.as_ref().is_some_and(|a| a.remote == from) {
            Slot::Active
        } else {
            trace!(from = %from, "candidate for no attempt");
            return;
        };
        if let Some(attempt) = self.attempt_mut(slot) {
            attempt.add_remote_candidate(candidate).await;
        }
    }

    async fn on_peer_not_found(&mut self, target: String) {
        if self.pending.as_ref().is_some_and(|p| p.remote == target) {
            self.drop_pending(Some(SessionError::PeerNotFound)).await;
        } else if self.active.as_ref().is_some_and(|a| a.remote == target) {
            self.teardown_active(false, "peer left relay").await;
            self.emit_error(SessionError::PeerNotFound);
        } else {
            debug!(target = %target, "peer-not-found for unrelated peer");
        }
    }

    // ── Transport events ─────────────────────────────────────────────────────

    async fn on_transport(&mut self, id: AttemptId, event: TransportEvent) {
        let Some(slot) = self.slot_of(id) else {
            trace!(attempt = %id, ?event, "stale transport event");
            return;
        };
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(a) = self.attempt_mut(slot) {
                    let target = a.remote.clone();
                    self.signal(ClientMessage::Candidate { target, candidate });
                }
            }
            TransportEvent::ChannelOpen(channel) => {
                if let Some(a) = self.attempt_mut(slot) {
                    a.channel = Some(channel);
                }
                if slot == Slot::Active {
                    self.on_channel_ready();
                }
            }
            TransportEvent::Message(msg) => {
                if slot == Slot::Active {
                    self.on_channel_message(msg).await;
                }
            }
            TransportEvent::StateChanged(state) => self.on_link_state(slot, state).await,
        }
    }

    fn on_channel_ready(&mut self) {
        let interval = self.config.heartbeat_interval;
        let inputs = self.inputs_tx.clone();
        let Some(active) = self.active.as_mut() else { return };

        active.liveness.reset();
        if !interval.is_zero() {
            let id = active.id;
            active.set_heartbeat(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if inputs.send(SessionInput::HeartbeatTick(id)).is_err() {
                        return;
                    }
                }
            }));
        }
        info!(event = "channel_open", attempt = %active.id, remote = %active.remote, "Data channel open");
        let remote = active.remote.clone();
        self.emit(SessionStatus::Connected { remote });
    }

    async fn on_link_state(&mut self, slot: Slot, state: LinkState) {
        if slot == Slot::Pending {
            match state {
                LinkState::Disconnected | LinkState::Failed | LinkState::Closed => {
                    self.drop_pending(Some(SessionError::NegotiationFailed)).await;
                }
                _ => trace!(?state, "pending link state"),
            }
            return;
        }

        match state {
            LinkState::Connected => self.on_link_connected(),
            LinkState::Disconnected => {
                let grace = self.config.recovery_grace;
                let Some(id) = self.active.as_ref().filter(|a| !a.recovering).map(|a| a.id) else {
                    return;
                };
                let timer = self.spawn_timer(grace, SessionInput::RecoveryExpired(id));
                let Some(active) = self.active.as_mut() else { return };
                active.recovering = true;
                active.arm_timer(timer);
                warn!(event = "link_disconnected", attempt = %id, grace_ms = grace.as_millis() as u64, "Connection lost, waiting for recovery");
                let remote = active.remote.clone();
                self.emit(SessionStatus::Recovering { remote });
            }
            LinkState::Failed | LinkState::Closed => {
                self.teardown_active(false, "link failed").await;
            }
            LinkState::Connecting => {}
        }
    }

    fn on_link_connected(&mut self) {
        let Some(active) = self.active.as_mut() else { return };
        if active.recovering {
            active.recovering = false;
            active.disarm_timer();
            info!(event = "link_recovered", attempt = %active.id, "Connection recovered");
            let remote = active.remote.clone();
            self.emit(SessionStatus::Connected { remote });
            return;
        }
        if active.established {
            return;
        }
        active.established = true;
        let total_ms = active.started_at.elapsed().as_millis() as u64;
        let signaling_ms = active
            .answered_at
            .map(|t| t.duration_since(active.started_at).as_millis() as u64);
        info!(
            event = "connection_established",
            attempt = %active.id,
            role = ?active.role,
            signaling_ms,
            total_ms,
            "Peer connection established"
        );
    }

    // ── Channel traffic ──────────────────────────────────────────────────────

    async fn on_channel_message(&mut self, msg: ChannelMessage) {
        match Inbound::from(msg) {
            Inbound::Chunk(data) => {
                if let Err(e) = self.receiver.on_chunk(data) {
                    warn!(event = "protocol_error", error = %e);
                }
            }
            Inbound::Control(ctrl) => self.on_control(ctrl).await,
            Inbound::OutOfBand(text) => {
                let e = ProtocolError::Malformed(text.chars().take(64).collect());
                debug!(event = "out_of_band_text", error = %e);
            }
        }
    }

    async fn on_control(&mut self, ctrl: ControlMessage) {
        match ctrl {
            ControlMessage::Metadata {
                file_name,
                file_size,
                batch_index,
                batch_total,
                total_batch_size,
            } => self.receiver.on_metadata(
                file_name,
                file_size,
                batch_index,
                batch_total,
                total_batch_size,
            ),
            ControlMessage::Done => {
                if let Err(e) = self.receiver.on_done() {
                    warn!(event = "protocol_error", error = %e);
                }
            }
            ControlMessage::CancelTransfer => {
                if self.receiver.on_cancel().is_none() {
                    debug!("cancel-transfer with no batch in progress");
                }
            }
            ControlMessage::Ping => {
                if let Some(active) = &self.active {
                    if let Err(e) = active.send_control(&ControlMessage::Pong).await {
                        debug!(error = %e, "pong not sent");
                    }
                }
            }
            ControlMessage::Pong => {
                if let Some(active) = self.active.as_mut() {
                    active.liveness.reset();
                }
            }
            ControlMessage::Disconnect => {
                self.teardown_active(false, "remote disconnect").await;
            }
            ControlMessage::Chat { text } => {
                let from = self
                    .active
                    .as_ref()
                    .map(|a| a.remote.clone())
                    .unwrap_or_default();
                info!(event = "chat_received", from = %from, len = text.len());
                let _ = self.events.send(SessionEvent::Chat { from, text });
            }
        }
    }

    async fn on_heartbeat(&mut self, id: AttemptId) {
        let stale_after = self.config.heartbeat_stale_after;
        let Some(active) = self.active.as_mut().filter(|a| a.id == id) else { return };

        if let Some(silence) = active.liveness.check(stale_after) {
            warn!(
                event = "heartbeat_stale",
                remote = %active.remote,
                silence_ms = silence.as_millis() as u64,
                "No pong from peer"
            );
        }
        if let Err(e) = active.send_control(&ControlMessage::Ping).await {
            trace!(error = %e, "ping not sent");
        }
    }
}
