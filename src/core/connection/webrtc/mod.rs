//! WebRTC transport.
//!
//! - One peer connection per negotiation attempt, trickle ICE.
//! - The initiator opens a single ordered, reliable data channel labelled
//!   `fileChannel`; the responder picks it up through `on_data_channel`.
//! - Callbacks are turned into [`TransportEvent`]s; nothing here knows
//!   about sessions or transfers.

mod data;
mod initializer;

pub use data::WebRtcChannel;

use crate::core::config::{DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVERS};
use crate::core::connection::{PeerTransport, Role, TransportEvents, TransportFactory};
use crate::core::protocol::relay::{IceCandidate, SdpKind, SessionDescription};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates [`WebRtcTransport`]s with a fixed ICE configuration.
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
    include_loopback: bool,
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self::new(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            include_loopback: false,
        }
    }

    /// Gather loopback candidates too (same-machine testing).
    pub fn with_loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, role: Role, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let api = initializer::create_webrtc_api(self.include_loopback)?;
        let pc = initializer::new_peer_connection(&api, initializer::ice_servers(&self.ice_servers))
            .await
            .context("creating peer connection")?;
        initializer::attach_pc_handlers(&pc, &events);

        let channel = match role {
            Role::Initiator => {
                let dc = pc
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                initializer::attach_dc_handlers(&dc, &events);
                Some(dc)
            }
            Role::Responder => None,
        };

        Ok(Arc::new(WebRtcTransport { pc, channel }))
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer | RTCSdpType::Pranswer => SdpKind::Answer,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(from_rtc(answer))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .context("applying remote description")
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!(candidate = %candidate.candidate, "adding remote candidate");
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(dc) = &self.channel {
            let _ = dc.close().await;
        }
        if let Err(e) = self.pc.close().await {
            warn!(event = "pc_close_failure", error = %e);
        }
    }
}
