//! One negotiation attempt: a transport, its candidate queue and the tasks
//! armed on its behalf.

use super::candidates::CandidateQueue;
use crate::core::connection::{DataChannel, PeerTransport, Role};
use crate::core::protocol::control::ControlMessage;
use crate::core::protocol::relay::{IceCandidate, SessionDescription};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Monotonic per-session attempt number. Timers and transport events carry
/// it so that anything outliving its attempt is recognized as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct Attempt {
    pub id: AttemptId,
    pub remote: String,
    pub role: Role,
    pub transport: Arc<dyn PeerTransport>,
    pub channel: Option<Arc<dyn DataChannel>>,
    pub recovering: bool,
    candidates: CandidateQueue,
    has_remote: bool,

    pub started_at: Instant,
    pub answered_at: Option<Instant>,
    pub established: bool,

    pub liveness: Liveness,

    forwarder: JoinHandle<()>,
    timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Attempt {
    pub fn new(
        id: AttemptId,
        role: Role,
        remote: String,
        transport: Arc<dyn PeerTransport>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote,
            role,
            transport,
            channel: None,
            recovering: false,
            candidates: CandidateQueue::new(),
            has_remote: false,
            started_at: now,
            answered_at: None,
            established: false,
            liveness: Liveness::new(),
            forwarder,
            timer: None,
            heartbeat: None,
        }
    }

    /// Replace the dial or recovery timer.
    pub fn arm_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(timer) {
            old.abort();
        }
    }

    pub fn disarm_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }

    pub fn set_heartbeat(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.heartbeat.replace(task) {
            old.abort();
        }
    }

    pub fn open_channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref().filter(|ch| ch.is_open())
    }

    /// Apply the remote description, then flush the queued candidates.
    pub async fn apply_remote(&mut self, desc: SessionDescription) -> Result<()> {
        self.transport.apply_remote_description(desc).await?;
        self.has_remote = true;

        let queued = self.candidates.drain();
        if !queued.is_empty() {
            debug!(attempt = %self.id, count = queued.len(), "flushing queued candidates");
        }
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    /// Apply the offer and produce the answer.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        self.apply_remote(offer).await?;
        self.transport.create_answer().await
    }

    /// Apply now when the remote description is known, queue otherwise.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.has_remote {
            if let Some(candidate) = self.candidates.push(candidate) {
                self.apply_candidate(candidate).await;
            }
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_candidate(candidate).await {
            warn!(event = "candidate_rejected", attempt = %self.id, error = %e);
        }
    }

    pub async fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        let Some(channel) = self.open_channel() else {
            anyhow::bail!("data channel is not open");
        };
        channel.send_text(msg.encode()?).await
    }

    /// Stop every task, optionally say goodbye, then close channel and transport.
    pub async fn close(mut self, notify: bool) {
        self.stop_tasks();
        if let Some(channel) = self.channel.take() {
            if notify && channel.is_open() {
                if let Ok(text) = ControlMessage::Disconnect.encode() {
                    if let Err(e) = channel.send_text(text).await {
                        debug!(attempt = %self.id, error = %e, "disconnect notice not sent");
                    }
                }
            }
            channel.close().await;
        }
        self.transport.close().await;
        debug!(attempt = %self.id, remote = %self.remote, "attempt closed");
    }

    fn stop_tasks(&mut self) {
        self.forwarder.abort();
        self.disarm_timer();
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Ping/pong bookkeeping. Silence is reported once, never acted upon.
#[derive(Debug)]
pub(crate) struct Liveness {
    last_pong: Instant,
    warned: bool,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            warned: false,
        }
    }

    /// A pong arrived, or the channel (re)opened.
    pub fn reset(&mut self) {
        self.last_pong = Instant::now();
        self.warned = false;
    }

    /// The current silence, the first time it exceeds `stale_after`.
    /// Stays quiet afterwards until the next [`Liveness::reset`].
    pub fn check(&mut self, stale_after: Duration) -> Option<Duration> {
        let silence = self.last_pong.elapsed();
        if silence > stale_after && !self.warned {
            self.warned = true;
            return Some(silence);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(6);

    #[tokio::test(start_paused = true)]
    async fn silence_is_reported_once_until_next_pong() {
        let mut live = Liveness::new();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(live.check(STALE), None);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(live.check(STALE), Some(Duration::from_secs(7)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(live.check(STALE), None);

        live.reset();
        assert_eq!(live.check(STALE), None);
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(live.check(STALE).is_some());
    }
}
