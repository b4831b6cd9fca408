//! Transport collaborators.
//!
//! The session never talks to a peer-connection library directly. It
//! drives a [`PeerTransport`] (description/candidate primitives) created by
//! a [`TransportFactory`], and streams files over the [`DataChannel`] the
//! transport reports once open. Everything the transport observes comes
//! back as [`TransportEvent`]s on the sink handed to the factory.
//!
//! - [`webrtc`]: real peer connections.
//! - [`memory`]: in-process pairs for tests and loopback runs.
//! - [`signaling`]: WebSocket client for the relay.

pub mod memory;
pub mod signaling;
pub mod webrtc;

use crate::core::protocol::control::ChannelMessage;
use crate::core::protocol::relay::{IceCandidate, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the offer/answer exchange an attempt plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Connection-level state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Transient loss; the transport may still recover.
    Disconnected,
    Failed,
    Closed,
}

pub enum TransportEvent {
    /// A locally gathered candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
    /// The data channel is open and ready for traffic.
    ChannelOpen(Arc<dyn DataChannel>),
    Message(ChannelMessage),
    StateChanged(LinkState),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ChannelOpen(_) => f.write_str("ChannelOpen"),
            Self::Message(ChannelMessage::Text(t)) => write!(f, "Message(text, {} bytes)", t.len()),
            Self::Message(ChannelMessage::Binary(b)) => {
                write!(f, "Message(binary, {} bytes)", b.len())
            }
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// An ordered, reliable, message-oriented channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn close(&self);
}

/// Negotiation primitives for one attempt.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create and apply the local offer.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create and apply the local answer. Requires a remote offer.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Fails when no remote description has been applied yet.
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a fresh transport. An initiator creates the data channel
    /// up front; a responder reports the one its peer opens.
    async fn create(&self, role: Role, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}
