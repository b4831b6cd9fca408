//! Relay worker: directory, stats and the HTTP/WebSocket server.

use super::args::RelayArgs;
use rtcportal::core::relay::{server, RelayHub};
use rtcportal::core::stats::ConnectionStats;
use rtcportal::utils::sos::SignalOfStop;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub async fn run(args: RelayArgs, sos: SignalOfStop) -> anyhow::Result<()> {
    let stats = Arc::new(ConnectionStats::new());
    let hub = Arc::new(RelayHub::new(stats.clone()));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port()));

    server::run(hub, addr, &args.allowed_origins, sos).await;

    let snapshot = stats.get_stats();
    info!(
        event = "relay_summary",
        attempts = snapshot.total_attempts,
        successes = snapshot.successful_connections,
        success_rate = snapshot.success_rate,
        "Relay shut down"
    );
    Ok(())
}
