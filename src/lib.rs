//! rtcportal: relay-assisted peer sessions and chunked file transfer.
//!
//! - [`core::relay`] forwards session descriptions and candidates between
//!   endpoints and keeps the connection statistics.
//! - [`core::session`] is the client-side negotiation state machine.
//! - [`core::pipeline`] streams batches of files over an established channel.

pub mod core;
pub mod utils;
