//! In-process transport.
//!
//! A [`MemoryNetwork`] hands out transports that pair up through the
//! descriptions they exchange: an offer or answer simply names the token of
//! the endpoint that produced it. Once the initiator applies the answer,
//! both sides get a linked [`MemoryChannel`] and a `Connected` state.
//!
//! Used by the test-suite and for loopback runs of the binary. The network
//! keeps every transport it created so tests can inspect applied candidates,
//! inject link-state changes or stall a channel's send buffer.

use super::{
    DataChannel, LinkState, PeerTransport, Role, TransportEvent, TransportEvents, TransportFactory,
};
use crate::core::protocol::control::ChannelMessage;
use crate::core::protocol::relay::{IceCandidate, SdpKind, SessionDescription};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

const SDP_PREFIX: &str = "memory:";

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_token: u64,
    endpoints: HashMap<u64, Arc<MemoryTransport>>,
    by_host: Vec<(String, Arc<MemoryTransport>)>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose transports are recorded under `host`.
    pub fn factory(&self, host: impl Into<String>) -> Arc<MemoryFactory> {
        Arc::new(MemoryFactory {
            network: self.clone(),
            host: host.into(),
        })
    }

    /// Every transport created for `host`, oldest first.
    pub fn transports(&self, host: &str) -> Vec<Arc<MemoryTransport>> {
        self.lock()
            .by_host
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn endpoint(&self, token: u64) -> Option<Arc<MemoryTransport>> {
        self.lock().endpoints.get(&token).cloned()
    }
}

pub struct MemoryFactory {
    network: MemoryNetwork,
    host: String,
}

#[async_trait]
impl TransportFactory for MemoryFactory {
    async fn create(&self, role: Role, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let mut net = self.network.lock();
        net.next_token += 1;
        let transport = Arc::new(MemoryTransport {
            token: net.next_token,
            role,
            network: self.network.clone(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        net.endpoints.insert(transport.token, transport.clone());
        net.by_host.push((self.host.clone(), transport.clone()));
        debug!(host = %self.host, token = transport.token, ?role, "memory transport created");
        Ok(transport)
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct MemoryTransport {
    token: u64,
    role: Role,
    network: MemoryNetwork,
    events: TransportEvents,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    remote_token: Option<u64>,
    has_remote: bool,
    applied: Vec<IceCandidate>,
    channel: Option<Arc<MemoryChannel>>,
    closed: bool,
}

impl MemoryTransport {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Candidates applied so far, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied.clone()
    }

    pub fn channel(&self) -> Option<Arc<MemoryChannel>> {
        self.lock().channel.clone()
    }

    /// Report a link-state change as if the network produced it.
    pub fn emit_state(&self, state: LinkState) {
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn local_description(&self, kind: SdpKind) -> SessionDescription {
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.token, 40000 + self.token),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}", self.token),
        }
    }

    /// Pair with the responder that produced `answer_token`.
    fn link(&self, answer_token: u64) -> Result<()> {
        let peer = self
            .network
            .endpoint(answer_token)
            .ok_or_else(|| anyhow!("no memory endpoint {answer_token}"))?;
        if peer.is_closed() {
            bail!("memory endpoint {answer_token} is closed");
        }

        let open = Arc::new(AtomicBool::new(true));
        let ours = Arc::new(MemoryChannel::new(open.clone(), peer.events.clone()));
        let theirs = Arc::new(MemoryChannel::new(open, self.events.clone()));

        self.lock().channel = Some(ours.clone());
        peer.lock().channel = Some(theirs.clone());

        let _ = self.events.send(TransportEvent::ChannelOpen(ours));
        let _ = peer.events.send(TransportEvent::ChannelOpen(theirs));
        self.emit_state(LinkState::Connected);
        peer.emit_state(LinkState::Connected);
        Ok(())
    }
}

fn parse_token(desc: &SessionDescription) -> Result<u64> {
    desc.sdp
        .strip_prefix(SDP_PREFIX)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| anyhow!("not a memory description: {}", desc.sdp))
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.role != Role::Initiator {
            bail!("responder cannot create an offer");
        }
        Ok(self.local_description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.lock().has_remote {
            bail!("no remote offer applied");
        }
        Ok(self.local_description(SdpKind::Answer))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let token = parse_token(&desc)?;
        {
            let mut st = self.lock();
            if st.closed {
                bail!("transport closed");
            }
            st.remote_token = Some(token);
            st.has_remote = true;
        }
        if desc.kind == SdpKind::Answer {
            self.link(token)?;
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut st = self.lock();
        if !st.has_remote {
            bail!("remote description not set");
        }
        st.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let (channel, remote) = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            (st.channel.take(), st.remote_token)
        };
        if let Some(ch) = channel {
            ch.open.store(false, Ordering::Release);
            if let Some(peer) = remote.and_then(|t| self.network.endpoint(t)) {
                peer.emit_state(LinkState::Disconnected);
            }
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// One half of a linked in-memory channel.
pub struct MemoryChannel {
    open: Arc<AtomicBool>,
    buffered: AtomicUsize,
    /// Send count after which the buffer reports as full; `0` = never.
    stall_at: AtomicUsize,
    peer: TransportEvents,
    sent: Mutex<Vec<ChannelMessage>>,
}

impl MemoryChannel {
    fn new(open: Arc<AtomicBool>, peer: TransportEvents) -> Self {
        Self {
            open,
            buffered: AtomicUsize::new(0),
            stall_at: AtomicUsize::new(0),
            peer,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Report a full send buffer once `sends` messages have gone through.
    /// Lets tests freeze a sender at an exact point of a batch.
    pub fn stall_after(&self, sends: usize) {
        self.stall_at.store(sends, Ordering::Release);
    }

    /// Everything sent through this half so far.
    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn deliver(&self, msg: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            bail!("memory channel closed");
        }
        if let Ok(mut log) = self.sent.lock() {
            log.push(msg.clone());
            if log.len() == self.stall_at.load(Ordering::Acquire) {
                self.buffered.store(usize::MAX / 2, Ordering::Release);
            }
        }
        self.peer
            .send(TransportEvent::Message(msg))
            .map_err(|_| anyhow!("remote side dropped"))
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.deliver(ChannelMessage::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.deliver(ChannelMessage::Binary(data))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn offer_answer_links_channels() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = net.factory("a").create(Role::Initiator, a_tx).await.unwrap();
        let b = net.factory("b").create(Role::Responder, b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(answer).await.unwrap();

        let mut a_channel = None;
        while let Ok(ev) = a_rx.try_recv() {
            if let TransportEvent::ChannelOpen(ch) = ev {
                a_channel = Some(ch);
            }
        }
        let a_channel = a_channel.expect("initiator channel");
        a_channel.send_text("hi".into()).await.unwrap();

        let mut got_text = false;
        while let Ok(ev) = b_rx.try_recv() {
            if let TransportEvent::Message(ChannelMessage::Text(t)) = ev {
                got_text = t == "hi";
            }
        }
        assert!(got_text);
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let net = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = net.factory("a").create(Role::Responder, tx).await.unwrap();
        assert!(t.add_candidate(IceCandidate::new("c1")).await.is_err());
    }

    #[tokio::test]
    async fn close_disconnects_peer() {
        let net = MemoryNetwork::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = net.factory("a").create(Role::Initiator, a_tx).await.unwrap();
        let b = net.factory("b").create(Role::Responder, b_tx).await.unwrap();
        b.apply_remote_description(a.create_offer().await.unwrap()).await.unwrap();
        a.apply_remote_description(b.create_answer().await.unwrap()).await.unwrap();

        a.close().await;
        let b_handle = net.transports("b").remove(0);
        assert!(!b_handle.channel().unwrap().is_open());

        let mut saw_disconnect = false;
        while let Ok(ev) = b_rx.try_recv() {
            if let TransportEvent::StateChanged(LinkState::Disconnected) = ev {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }
}
