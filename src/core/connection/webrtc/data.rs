//! [`DataChannel`] over an `RTCDataChannel`.

use crate::core::connection::DataChannel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    pub(crate) fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }

    /// Verify the channel is `Open`; return an error otherwise.
    fn assert_open(&self) -> Result<()> {
        let state = self.dc.ready_state();
        if state == RTCDataChannelState::Open {
            Ok(())
        } else {
            warn!(
                event = "send_channel_not_open",
                ?state,
                "Attempted send on non-open data channel"
            );
            Err(anyhow!("Data channel not open: {:?}", state))
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.assert_open()?;
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.assert_open()?;
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            warn!(event = "channel_close_failure", error = %e);
        }
    }
}
