//! Centralized configuration constants for rtcportal.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (message tags, channel label) stay
//! in their respective protocol modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Size of one binary chunk on the data channel (16 KiB).
///
/// Small enough to stay below the default SCTP message size accepted by
/// every browser implementation.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High-water mark for the data channel send buffer (bytes).
/// While `buffered_amount` exceeds this value the sender stops issuing
/// chunks and polls until it drains.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 64 * 1024;

/// Interval between backpressure / pause polls.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing between two progress events of the same batch.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(100);

/// Elapsed batch time before a speed and ETA are reported.
pub const SPEED_WARMUP: Duration = Duration::from_millis(500);

/// Files smaller than this are sent without honouring pause requests.
pub const MIN_PAUSE_SIZE: u64 = 1024 * 1024;

/// Largest file accepted by the selection helper (2 GiB).
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// ── Session / Negotiation ───────────────────────────────────────────────────

/// How long a dial waits for an answer before giving up.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period a disconnected transport gets to recover.
pub const RECOVERY_GRACE: Duration = Duration::from_secs(5);

/// Ping interval while the data channel is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Silence after which a missing pong is reported (informational only).
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(6);

/// Lifetime of a transient error status before the host should clear it.
pub const ALERT_TIMEOUT: Duration = Duration::from_secs(4);

/// Label of the single data channel created by the initiator.
pub const DATA_CHANNEL_LABEL: &str = "fileChannel";

/// Public STUN servers used when none are configured.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ── Relay ───────────────────────────────────────────────────────────────────

/// Default HTTP/WebSocket port of the relay.
pub const DEFAULT_PORT: u16 = 3000;

/// Length of the endpoint ids handed out by the relay.
pub const PEER_ID_LEN: usize = 12;
