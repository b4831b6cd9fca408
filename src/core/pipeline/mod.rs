//! Transfer pipeline: batches of files over an open data channel.
//!
//! ```text
//! sender:   Metadata ─► chunk* ─► Done ─► Metadata ─► ... ─► Done
//! receiver: mirrors the batch, assembles each file on Done
//! ```
//!
//! Files of a batch are strictly sequential. The sender suspends while the
//! channel's send buffer is above the high-water mark or the batch is
//! paused, and re-checks its stop token at every poll.

pub mod batch;
pub mod progress;
pub mod receiver;
pub mod sender;

use crate::core::config::{
    BACKPRESSURE_POLL_INTERVAL, CHUNK_SIZE, DC_BUFFERED_AMOUNT_HIGH, MIN_PAUSE_SIZE,
    PROGRESS_THROTTLE, SPEED_WARMUP,
};
use batch::CompletedBatch;
use progress::BatchProgress;
use std::time::Duration;

/// Tunables of the transfer engine. Defaults come from [`crate::core::config`].
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub high_water_mark: usize,
    pub poll_interval: Duration,
    pub progress_throttle: Duration,
    pub speed_warmup: Duration,
    /// Files below this size ignore pause requests. `0` disables the exemption.
    pub min_pause_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water_mark: DC_BUFFERED_AMOUNT_HIGH,
            poll_interval: BACKPRESSURE_POLL_INTERVAL,
            progress_throttle: PROGRESS_THROTTLE,
            speed_warmup: SPEED_WARMUP,
            min_pause_size: MIN_PAUSE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Host-observable transfer events, both directions.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(BatchProgress),
    FileSent {
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    FileReceived {
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    SendCompleted {
        files: u32,
        bytes: u64,
    },
    /// Local stop or session teardown ended the batch early.
    SendStopped {
        files_sent: u32,
    },
    SendFailed(String),
    Paused(bool),
    ReceiveCompleted(CompletedBatch),
    /// Sender cancelled; carries the files completed before the cancel.
    ReceiveCancelled(CompletedBatch),
}
