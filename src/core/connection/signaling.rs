//! Relay client.
//!
//! A [`RelayLink`] is a pair of queues: client frames go out, server frames
//! come in. Over the network the link is backed by a WebSocket; inside one
//! process [`crate::core::relay::RelayHub::attach`] hands out the same type.

use crate::core::protocol::relay::{ClientMessage, ServerMessage};
use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Connect to the relay's WebSocket endpoint (e.g. `ws://host:3000/ws`).
pub async fn connect(url: &str) -> Result<RelayLink> {
    let (ws_stream, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to relay at {url}"))?;
    info!(event = "relay_connected", %url, "Connected to relay");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(event = "relay_encode_failure", error = %e);
                    continue;
                }
            };
            if let Err(e) = ws_write.send(Message::Text(text)).await {
                warn!(event = "relay_write_failure", error = %anyhow!(e));
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(event = "relay_unknown_frame", error = %e, "ignoring frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(event = "relay_read_failure", error = %e);
                    break;
                }
            }
        }
        info!(event = "relay_disconnected", "Relay connection closed");
    });

    Ok(RelayLink {
        outbound: out_tx,
        inbound: in_rx,
    })
}
