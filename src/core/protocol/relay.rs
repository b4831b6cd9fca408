//! Relay signaling messages.
//!
//! Every frame is a JSON object tagged by `type`. Descriptions and
//! candidates keep the browser `RTCSessionDescriptionInit` /
//! `RTCIceCandidateInit` shapes so browser endpoints interoperate.

use serde::{Deserialize, Serialize};

// ── Descriptions / Candidates ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A local or remote session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network-path candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Offer {
        target: String,
        sdp: SessionDescription,
    },
    Answer {
        target: String,
        sdp: SessionDescription,
    },
    Candidate {
        target: String,
        candidate: IceCandidate,
    },
    ConnectionAttempt,
    ConnectionSuccess,
    ConnectionUserFailed,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame after connecting: the id the relay assigned.
    Welcome { id: String },
    Offer {
        sdp: SessionDescription,
        caller: String,
    },
    Answer {
        sdp: SessionDescription,
        callee: String,
    },
    Candidate {
        candidate: IceCandidate,
        from: String,
    },
    PeerNotFound { target: String },
}
