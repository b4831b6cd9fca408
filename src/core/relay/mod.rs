//! Relay: endpoint directory and message forwarding.
//!
//! Endpoints register and get a short id. Offers, answers and candidates
//! addressed to an id are forwarded with the sender's id attached; unknown
//! targets get a `peer-not-found` reply. The three stats frames feed
//! [`ConnectionStats`].

pub mod server;

use crate::core::config::PEER_ID_LEN;
use crate::core::connection::signaling::RelayLink;
use crate::core::protocol::relay::{ClientMessage, ServerMessage};
use crate::core::stats::ConnectionStats;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct RelayHub {
    directory: RwLock<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
    stats: Arc<ConnectionStats>,
}

impl RelayHub {
    pub fn new(stats: Arc<ConnectionStats>) -> Self {
        Self {
            directory: RwLock::new(HashMap::new()),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub async fn endpoint_count(&self) -> usize {
        self.directory.read().await.len()
    }

    /// Add an endpoint and greet it with its id.
    pub async fn register(&self) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut dir = self.directory.write().await;
        let id = loop {
            let candidate: String = Uuid::new_v4().simple().to_string()[..PEER_ID_LEN].to_string();
            if !dir.contains_key(&candidate) {
                break candidate;
            }
        };
        let _ = tx.send(ServerMessage::Welcome { id: id.clone() });
        dir.insert(id.clone(), tx);
        info!(event = "endpoint_registered", id = %id, endpoints = dir.len());
        (id, rx)
    }

    pub async fn unregister(&self, id: &str) {
        let mut dir = self.directory.write().await;
        if dir.remove(id).is_some() {
            info!(event = "endpoint_left", id = %id, endpoints = dir.len());
        }
    }

    /// Route one frame sent by `from`.
    pub async fn handle(&self, from: &str, msg: ClientMessage) {
        let (target, forwarded) = match msg {
            ClientMessage::ConnectionAttempt => {
                self.stats.increment_attempts();
                return;
            }
            ClientMessage::ConnectionSuccess => {
                if !self.stats.increment_successes() {
                    debug!(from = %from, "success without matching attempt");
                }
                return;
            }
            ClientMessage::ConnectionUserFailed => {
                self.stats.decrement_attempts();
                return;
            }
            ClientMessage::Offer { target, sdp } => {
                if target == from {
                    warn!(event = "self_offer_dropped", id = %from);
                    return;
                }
                let msg = ServerMessage::Offer {
                    sdp,
                    caller: from.to_string(),
                };
                (target, msg)
            }
            ClientMessage::Answer { target, sdp } => {
                let msg = ServerMessage::Answer {
                    sdp,
                    callee: from.to_string(),
                };
                (target, msg)
            }
            ClientMessage::Candidate { target, candidate } => {
                let msg = ServerMessage::Candidate {
                    candidate,
                    from: from.to_string(),
                };
                (target, msg)
            }
        };

        let dir = self.directory.read().await;
        let delivered = dir
            .get(&target)
            .is_some_and(|tx| tx.send(forwarded).is_ok());
        if delivered {
            debug!(from = %from, to = %target, "forwarded");
            return;
        }
        debug!(event = "peer_not_found", from = %from, target = %target);
        if let Some(tx) = dir.get(from) {
            let _ = tx.send(ServerMessage::PeerNotFound { target });
        }
    }

    /// In-process endpoint: register and pump its outbound frames through
    /// [`RelayHub::handle`] until the link's sender is dropped.
    pub async fn attach(self: &Arc<Self>) -> (String, RelayLink) {
        let (id, inbound) = self.register().await;
        let (outbound, mut frames) = mpsc::unbounded_channel::<ClientMessage>();

        let hub = Arc::clone(self);
        let endpoint = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = frames.recv().await {
                hub.handle(&endpoint, msg).await;
            }
            hub.unregister(&endpoint).await;
        });
        (id, RelayLink { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::relay::{IceCandidate, SessionDescription};

    fn hub() -> Arc<RelayHub> {
        Arc::new(RelayHub::new(Arc::new(ConnectionStats::new())))
    }

    #[tokio::test]
    async fn register_sends_welcome_with_short_id() {
        let hub = hub();
        let (id, mut rx) = hub.register().await;
        assert_eq!(id.len(), PEER_ID_LEN);
        assert_eq!(rx.recv().await, Some(ServerMessage::Welcome { id }));
    }

    #[tokio::test]
    async fn forwards_offer_with_caller() {
        let hub = hub();
        let (a, _a_rx) = hub.register().await;
        let (b, mut b_rx) = hub.register().await;
        b_rx.recv().await; // welcome

        hub.handle(
            &a,
            ClientMessage::Offer {
                target: b.clone(),
                sdp: SessionDescription::offer("v=0"),
            },
        )
        .await;
        assert_eq!(
            b_rx.recv().await,
            Some(ServerMessage::Offer {
                sdp: SessionDescription::offer("v=0"),
                caller: a
            })
        );
    }

    #[tokio::test]
    async fn unknown_target_gets_peer_not_found() {
        let hub = hub();
        let (a, mut a_rx) = hub.register().await;
        a_rx.recv().await;

        hub.handle(
            &a,
            ClientMessage::Candidate {
                target: "missing".into(),
                candidate: IceCandidate::new("c"),
            },
        )
        .await;
        assert_eq!(
            a_rx.recv().await,
            Some(ServerMessage::PeerNotFound {
                target: "missing".into()
            })
        );
    }

    #[tokio::test]
    async fn self_offer_is_dropped() {
        let hub = hub();
        let (a, mut a_rx) = hub.register().await;
        a_rx.recv().await;
        hub.handle(
            &a,
            ClientMessage::Offer {
                target: a.clone(),
                sdp: SessionDescription::offer("v=0"),
            },
        )
        .await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_frames_update_counters() {
        let hub = hub();
        let (a, _rx) = hub.register().await;
        hub.handle(&a, ClientMessage::ConnectionAttempt).await;
        hub.handle(&a, ClientMessage::ConnectionAttempt).await;
        hub.handle(&a, ClientMessage::ConnectionSuccess).await;
        hub.handle(&a, ClientMessage::ConnectionUserFailed).await;
        assert_eq!(hub.stats().counts(), (1, 1));
    }

    #[tokio::test]
    async fn attach_unregisters_when_link_dropped() {
        let hub = hub();
        let (_id, link) = hub.attach().await;
        assert_eq!(hub.endpoint_count().await, 1);
        drop(link);
        for _ in 0..50 {
            if hub.endpoint_count().await == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("endpoint still registered");
    }
}
