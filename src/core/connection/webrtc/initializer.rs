//! WebRTC API construction and peer-connection callbacks.

use super::data::WebRtcChannel;
use crate::core::connection::{LinkState, TransportEvent, TransportEvents};
use crate::core::protocol::control::ChannelMessage;
use crate::core::protocol::relay::IceCandidate;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

pub(crate) fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    urls.iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect()
}

pub(crate) fn create_webrtc_api(include_loopback: bool) -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_include_loopback_candidate(include_loopback);

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

pub(crate) async fn new_peer_connection(
    api: &webrtc::api::API,
    ice_servers: Vec<RTCIceServer>,
) -> Result<Arc<RTCPeerConnection>> {
    Ok(Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    ))
}

/// Route peer-connection callbacks into the transport event sink.
pub(crate) fn attach_pc_handlers(pc: &Arc<RTCPeerConnection>, events: &TransportEvents) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!(event = "candidate_encode_failure", error = %e),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let tx = tx.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", "WebRTC connection established");
                    LinkState::Connected
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                    LinkState::Disconnected
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", "WebRTC connection failed");
                    LinkState::Failed
                }
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => return,
            };
            let _ = tx.send(TransportEvent::StateChanged(state));
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(label = %dc.label(), "remote data channel announced");
            attach_dc_handlers(&dc, &tx);
        })
    }));
}

/// Report open/message events of `dc`.
pub(crate) fn attach_dc_handlers(dc: &Arc<RTCDataChannel>, events: &TransportEvents) {
    let tx = events.clone();
    let channel = Arc::new(WebRtcChannel::new(dc.clone()));
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        let channel = channel.clone();
        Box::pin(async move {
            info!(event = "channel_open", "Data channel open");
            let _ = tx.send(TransportEvent::ChannelOpen(channel));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let msg = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelMessage::Text(text),
                    Err(_) => {
                        warn!(event = "invalid_utf8", "Dropping non-UTF-8 text message");
                        return;
                    }
                }
            } else {
                ChannelMessage::Binary(msg.data)
            };
            let _ = tx.send(TransportEvent::Message(msg));
        })
    }));
}
