//! Wire formats.
//!
//! - [`relay`]: JSON text frames exchanged with the relay over WebSocket.
//! - [`control`]: JSON control messages and raw binary chunks on the data
//!   channel.

pub mod control;
pub mod relay;
