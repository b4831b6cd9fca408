pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod stats;
