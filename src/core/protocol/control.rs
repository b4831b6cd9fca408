//! Data channel protocol.
//!
//! Exactly two wire shapes travel over the channel:
//!
//!   text   = JSON `ControlMessage`, tagged by `type`
//!   binary = one raw file chunk (at most `CHUNK_SIZE` bytes)
//!
//! Text that does not parse as a known control message is out-of-band:
//! logged by the caller, never fatal.

use crate::core::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control messages exchanged over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    // ── File Transfer ─────────────────────────────────────────────────────────
    /// Announces the next file of a batch. Chunks follow, then `Done`.
    #[serde(rename_all = "camelCase")]
    Metadata {
        file_name: String,
        file_size: u64,
        #[serde(default = "one")]
        batch_index: u32,
        #[serde(default = "one")]
        batch_total: u32,
        /// Absent from single-file senders; the receiver falls back to `file_size`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_batch_size: Option<u64>,
    },
    /// Current file is complete.
    Done,
    /// Sender stopped the batch; the in-progress file is void.
    CancelTransfer,

    // ── Session ───────────────────────────────────────────────────────────────
    Ping,
    Pong,
    /// Remote side is ending the session.
    Disconnect,
    /// Free-form text from browser endpoints.
    Chat { text: String },
}

fn one() -> u32 {
    1
}

impl ControlMessage {
    pub fn metadata(
        file_name: impl Into<String>,
        file_size: u64,
        batch_index: u32,
        batch_total: u32,
        total_batch_size: u64,
    ) -> Self {
        Self::Metadata {
            file_name: file_name.into(),
            file_size,
            batch_index,
            batch_total,
            total_batch_size: Some(total_batch_size),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// One message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Chunk(Bytes),
    /// Text that is not a recognized control message.
    OutOfBand(String),
}

impl From<ChannelMessage> for Inbound {
    fn from(msg: ChannelMessage) -> Self {
        match msg {
            ChannelMessage::Binary(data) => Inbound::Chunk(data),
            ChannelMessage::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(ctrl) => Inbound::Control(ctrl),
                Err(_) => Inbound::OutOfBand(text),
            },
        }
    }
}
