//! HTTP/WebSocket front of the relay.
//!
//! ```text
//! GET /ws                     WebSocket upgrade, one endpoint per socket
//! GET /api/connection-stats   ConnectionStats snapshot as JSON
//! GET /test                   liveness page
//! ```

use super::RelayHub;
use crate::core::protocol::relay::ClientMessage;
use crate::utils::sos::SignalOfStop;
use futures::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use warp::Filter;

const TEST_PAGE: &str = "<!DOCTYPE html><html><body><h1>rtcportal relay is running</h1></body></html>";

/// All relay routes with CORS applied. An empty `origins` list allows any
/// origin.
pub fn routes(
    hub: Arc<RelayHub>,
    origins: &[String],
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone + Send + Sync + 'static
{
    let hub_filter = warp::any().map(move || hub.clone());

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(hub_filter.clone())
        .map(|ws: warp::ws::Ws, hub: Arc<RelayHub>| {
            ws.on_upgrade(move |socket| handle_connection(socket, hub))
        });

    let stats_route = warp::path!("api" / "connection-stats")
        .and(warp::get())
        .and(hub_filter)
        .and_then(handle_stats);

    let test_route = warp::path("test")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::html(TEST_PAGE));

    let mut cors = warp::cors().allow_methods(vec!["GET", "OPTIONS"]);
    cors = if origins.is_empty() {
        cors.allow_any_origin()
    } else {
        cors.allow_origins(origins.iter().map(String::as_str))
    };

    ws_route.or(stats_route).or(test_route).with(cors)
}

/// Serve until `sos` fires.
pub async fn run(hub: Arc<RelayHub>, addr: SocketAddr, origins: &[String], sos: SignalOfStop) {
    let routes = routes(hub, origins);
    info!(event = "relay_listening", %addr, "Relay listening");
    if sos.select(warp::serve(routes).run(addr)).await.is_none() {
        info!(event = "relay_shutdown", "Relay stopped");
    }
}

async fn handle_stats(hub: Arc<RelayHub>) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&hub.stats().get_stats()))
}

async fn handle_connection(ws: warp::ws::WebSocket, hub: Arc<RelayHub>) {
    let (id, mut inbound) = hub.register().await;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Directory -> socket
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else { continue };
            if ws_tx.send(warp::ws::Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    // Socket -> hub
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    match serde_json::from_str::<ClientMessage>(text) {
                        Ok(frame) => hub.handle(&id, frame).await,
                        Err(e) => debug!(id = %id, error = %e, "unrecognized frame"),
                    }
                } else if msg.is_close() {
                    break;
                }
            }
            Err(e) => {
                debug!(id = %id, error = %e, "socket error");
                break;
            }
        }
    }

    hub.unregister(&id).await;
    forward_task.abort();
}
