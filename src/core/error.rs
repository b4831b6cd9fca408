//! Error taxonomy of the core.
//!
//! None of these are process-fatal: session errors return the session to
//! `Idle`, transfer errors abort only the running batch and protocol
//! errors are logged and dropped.

use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by [`crate::core::session::PeerSession`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid peer ID!")]
    InvalidPeerId,

    #[error("Cannot connect to yourself.")]
    SelfDial,

    #[error("Already connected.")]
    AlreadyConnected,

    #[error("Peer ID not found!")]
    PeerNotFound,

    #[error("Connection timed out.")]
    DialTimeout,

    #[error("Failed to establish connection.")]
    NegotiationFailed,

    #[error("signaling: {0}")]
    Signaling(String),
}

impl SessionError {
    /// Broad category used in logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPeerId | Self::SelfDial | Self::AlreadyConnected => ErrorKind::Validation,
            Self::PeerNotFound | Self::Signaling(_) => ErrorKind::Signaling,
            Self::DialTimeout => ErrorKind::Timeout,
            Self::NegotiationFailed => ErrorKind::Negotiation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Signaling,
    Negotiation,
    Timeout,
}

/// Failures of a single batch.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no files to send")]
    EmptyBatch,

    #[error("data channel is not open")]
    ChannelNotOpen,

    #[error("data channel closed during transfer")]
    ChannelClosed,

    #[error("a batch is already in progress")]
    Busy,

    #[error("failed to read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(String),
}

/// Malformed or unexpected traffic on the data channel or the relay socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("chunk received with no file in progress")]
    UnexpectedChunk,

    #[error("done received with no file in progress")]
    UnexpectedDone,
}

/// A transient error status: what the host should display, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub error: SessionError,
    pub expires_in: Duration,
}
