//! Batch sender.
//!
//! Streams an ordered list of files over one data channel:
//!
//! ```text
//! for each file:  Metadata ─► (wait ─► chunk)* ─► Done
//! ```
//!
//! The wait step is the only suspension point of the loop. It polls every
//! `poll_interval` while the channel's buffered amount is above the
//! high-water mark or the batch is paused, and gives up as soon as the
//! batch's [`SignalOfStop`] fires.

use super::batch::FileRef;
use super::progress::ThroughputMeter;
use super::{Direction, TransferConfig, TransferEvent};
use crate::core::connection::DataChannel;
use crate::core::error::TransferError;
use crate::core::protocol::control::ControlMessage;
use crate::utils::sos::SignalOfStop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed { files: u32, bytes: u64 },
    Stopped { files_sent: u32 },
}

/// Cloneable handle; clones share pause/stop state.
#[derive(Clone)]
pub struct BatchSender {
    config: TransferConfig,
    shared: Arc<Shared>,
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    /// Set by [`BatchSender::stop`]; `abort` leaves it clear.
    notify_peer: AtomicBool,
    stop: Mutex<Option<SignalOfStop>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

/// Clears the running flag however `send_batch` exits.
struct RunningGuard<'a>(&'a Shared);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.stop.lock() {
            slot.take();
        }
        self.0.paused.store(false, Ordering::Release);
        self.0.running.store(false, Ordering::Release);
    }
}

impl BatchSender {
    pub fn new(config: TransferConfig, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                notify_peer: AtomicBool::new(false),
                stop: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Flip the pause flag. Returns the new state; `false` when idle.
    pub fn toggle_pause(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let paused = !self.shared.paused.fetch_xor(true, Ordering::AcqRel);
        info!(event = "transfer_pause_toggled", paused);
        self.emit(TransferEvent::Paused(paused));
        paused
    }

    /// User stop: the running batch sends `cancel-transfer` and ends.
    pub fn stop(&self) -> bool {
        self.shared.notify_peer.store(true, Ordering::Release);
        self.cancel()
    }

    /// Session teardown: end the running batch without telling the peer.
    pub fn abort(&self) -> bool {
        self.shared.notify_peer.store(false, Ordering::Release);
        self.cancel()
    }

    fn cancel(&self) -> bool {
        let sos = self.shared.stop.lock().ok().and_then(|slot| slot.clone());
        match sos {
            Some(sos) => {
                sos.cancel();
                true
            }
            None => false,
        }
    }

    fn emit(&self, ev: TransferEvent) {
        let _ = self.shared.events.send(ev);
    }

    /// Send `files` in order. Emits progress and a final
    /// `SendCompleted` / `SendStopped` / `SendFailed` event.
    pub async fn send_batch(
        &self,
        channel: Arc<dyn DataChannel>,
        files: Vec<FileRef>,
    ) -> Result<BatchOutcome, TransferError> {
        if files.is_empty() {
            return Err(TransferError::EmptyBatch);
        }
        if !channel.is_open() {
            return Err(TransferError::ChannelNotOpen);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(TransferError::Busy);
        }
        let sos = SignalOfStop::new();
        self.shared.notify_peer.store(false, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        if let Ok(mut slot) = self.shared.stop.lock() {
            *slot = Some(sos.clone());
        }
        let _guard = RunningGuard(&self.shared);

        let result = self.run(&channel, &files, &sos).await;

        match &result {
            Ok(BatchOutcome::Completed { files, bytes }) => {
                info!(event = "batch_sent", files, bytes, "Batch sent");
                self.emit(TransferEvent::SendCompleted {
                    files: *files,
                    bytes: *bytes,
                });
            }
            Ok(BatchOutcome::Stopped { files_sent }) => {
                if self.shared.notify_peer.load(Ordering::Acquire) && channel.is_open() {
                    if let Err(e) = send_control(&channel, &ControlMessage::CancelTransfer).await {
                        warn!(event = "cancel_notify_failure", error = %e);
                    }
                }
                info!(event = "batch_stopped", files_sent, "Batch stopped");
                self.emit(TransferEvent::SendStopped {
                    files_sent: *files_sent,
                });
            }
            Err(e) => {
                warn!(event = "batch_failed", error = %e, "Batch aborted");
                self.emit(TransferEvent::SendFailed(e.to_string()));
            }
        }
        result
    }

    async fn run(
        &self,
        channel: &Arc<dyn DataChannel>,
        files: &[FileRef],
        sos: &SignalOfStop,
    ) -> Result<BatchOutcome, TransferError> {
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        let batch_total = files.len() as u32;
        let mut meter = ThroughputMeter::new(
            total_bytes,
            self.config.progress_throttle,
            self.config.speed_warmup,
        );
        let mut files_sent = 0u32;

        for (i, file) in files.iter().enumerate() {
            if sos.cancelled() {
                return Ok(BatchOutcome::Stopped { files_sent });
            }
            let batch_index = i as u32 + 1;
            let read_err = |source| TransferError::Read {
                name: file.name.clone(),
                source,
            };
            let mut reader = file.open().await.map_err(read_err)?;

            send_control(
                channel,
                &ControlMessage::metadata(&file.name, file.size, batch_index, batch_total, total_bytes),
            )
            .await?;
            debug!(file = %file.name, size = file.size, batch_index, batch_total, "metadata sent");

            let honour_pause = file.size >= self.config.min_pause_size;
            let mut offset = 0u64;
            while offset < file.size {
                let chunk = reader
                    .read_chunk(offset, self.config.chunk_size, file.size)
                    .await
                    .map_err(read_err)?;
                if chunk.is_empty() {
                    return Err(read_err(std::io::ErrorKind::UnexpectedEof.into()));
                }

                if !self.wait_ready(channel, honour_pause, sos).await? {
                    return Ok(BatchOutcome::Stopped { files_sent });
                }

                let len = chunk.len() as u64;
                channel
                    .send_binary(chunk)
                    .await
                    .map_err(|e| send_error(channel, e))?;
                offset += len;
                meter.advance(len);

                if meter.should_emit() {
                    self.emit(TransferEvent::Progress(meter.snapshot(
                        Direction::Send,
                        &file.name,
                        batch_index,
                        batch_total,
                    )));
                }
            }

            send_control(channel, &ControlMessage::Done).await?;
            files_sent += 1;
            self.emit(TransferEvent::FileSent {
                name: file.name.clone(),
                size: file.size,
                index: batch_index,
                total: batch_total,
            });
        }

        Ok(BatchOutcome::Completed {
            files: files_sent,
            bytes: meter.transferred(),
        })
    }

    /// Suspend until a chunk may be sent. `Ok(false)` means stop requested.
    async fn wait_ready(
        &self,
        channel: &Arc<dyn DataChannel>,
        honour_pause: bool,
        sos: &SignalOfStop,
    ) -> Result<bool, TransferError> {
        let mut waiting = false;
        loop {
            if sos.cancelled() {
                return Ok(false);
            }
            if !channel.is_open() {
                return Err(TransferError::ChannelClosed);
            }
            let paused = honour_pause && self.is_paused();
            let buffered = channel.buffered_amount().await;
            if !paused && buffered <= self.config.high_water_mark {
                return Ok(true);
            }
            if !waiting {
                debug!(
                    event = "backpressure_wait",
                    buffered,
                    high_watermark = self.config.high_water_mark,
                    paused,
                    "Waiting before next chunk"
                );
                waiting = true;
            }
            if sos
                .select(tokio::time::sleep(self.config.poll_interval))
                .await
                .is_none()
            {
                return Ok(false);
            }
        }
    }
}

async fn send_control(
    channel: &Arc<dyn DataChannel>,
    msg: &ControlMessage,
) -> Result<(), TransferError> {
    let text = msg.encode().map_err(|e| TransferError::Send(e.to_string()))?;
    channel
        .send_text(text)
        .await
        .map_err(|e| send_error(channel, e))
}

fn send_error(channel: &Arc<dyn DataChannel>, e: anyhow::Error) -> TransferError {
    if channel.is_open() {
        TransferError::Send(e.to_string())
    } else {
        TransferError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::control::ChannelMessage;
    use anyhow::bail;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Records every send together with the buffered amount seen at that moment.
    #[derive(Default)]
    struct MockChannel {
        closed: AtomicBool,
        buffered: AtomicUsize,
        log: Mutex<Vec<(ChannelMessage, usize)>>,
        /// Raise `buffered` to this after the n-th binary send.
        block_after: Mutex<Option<(usize, usize)>>,
    }

    impl MockChannel {
        fn messages(&self) -> Vec<ChannelMessage> {
            self.log.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        fn binaries(&self) -> Vec<(usize, usize)> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(m, b)| match m {
                    ChannelMessage::Binary(d) => Some((d.len(), *b)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl DataChannel for MockChannel {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::Acquire)
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::Acquire)
        }

        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            if !self.is_open() {
                bail!("closed");
            }
            let b = self.buffered.load(Ordering::Acquire);
            self.log.lock().unwrap().push((ChannelMessage::Text(text), b));
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> anyhow::Result<()> {
            if !self.is_open() {
                bail!("closed");
            }
            let b = self.buffered.load(Ordering::Acquire);
            let mut log = self.log.lock().unwrap();
            log.push((ChannelMessage::Binary(data), b));
            let sent = log
                .iter()
                .filter(|(m, _)| matches!(m, ChannelMessage::Binary(_)))
                .count();
            if let Some((n, amount)) = *self.block_after.lock().unwrap() {
                if sent == n {
                    self.buffered.store(amount, Ordering::Release);
                }
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            poll_interval: Duration::from_millis(5),
            min_pause_size: 0,
            ..TransferConfig::default()
        }
    }

    fn sender() -> (BatchSender, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BatchSender::new(config(), tx), rx)
    }

    fn control(msg: &ChannelMessage) -> Option<ControlMessage> {
        match msg {
            ChannelMessage::Text(t) => serde_json::from_str(t).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn chunks_single_file_into_16k_pieces() {
        let (sender, _rx) = sender();
        let ch = Arc::new(MockChannel::default());
        let outcome = sender
            .send_batch(ch.clone(), vec![FileRef::from_bytes("f.bin", vec![1u8; 40960])])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Completed { files: 1, bytes: 40960 });

        let msgs = ch.messages();
        assert_eq!(
            control(&msgs[0]),
            Some(ControlMessage::metadata("f.bin", 40960, 1, 1, 40960))
        );
        let sizes: Vec<usize> = ch.binaries().iter().map(|(s, _)| *s).collect();
        assert_eq!(sizes, vec![16384, 16384, 8192]);
        assert_eq!(control(msgs.last().unwrap()), Some(ControlMessage::Done));
    }

    #[tokio::test]
    async fn rejects_empty_batch_and_closed_channel() {
        let (sender, _rx) = sender();
        let ch = Arc::new(MockChannel::default());
        assert!(matches!(
            sender.send_batch(ch.clone(), vec![]).await,
            Err(TransferError::EmptyBatch)
        ));
        ch.close().await;
        assert!(matches!(
            sender
                .send_batch(ch, vec![FileRef::from_bytes("a", vec![1u8; 4])])
                .await,
            Err(TransferError::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn never_sends_above_high_water_mark() {
        let (sender, _rx) = sender();
        let ch = Arc::new(MockChannel::default());
        *ch.block_after.lock().unwrap() = Some((2, 200 * 1024));

        let drain = {
            let ch = ch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ch.buffered.store(0, Ordering::Release);
            })
        };
        sender
            .send_batch(ch.clone(), vec![FileRef::from_bytes("f", vec![0u8; 16384 * 5])])
            .await
            .unwrap();
        drain.await.unwrap();

        let binaries = ch.binaries();
        assert_eq!(binaries.len(), 5);
        for (_, buffered) in binaries {
            assert!(buffered <= DC_HWM);
        }
    }

    const DC_HWM: usize = crate::core::config::DC_BUFFERED_AMOUNT_HIGH;

    #[tokio::test]
    async fn pause_blocks_until_resumed() {
        let (sender, _rx) = sender();
        let ch = Arc::new(MockChannel::default());
        // Park the sender in the wait loop after the first chunk.
        *ch.block_after.lock().unwrap() = Some((1, 200 * 1024));

        let task = {
            let sender = sender.clone();
            let ch = ch.clone();
            tokio::spawn(async move {
                sender
                    .send_batch(ch, vec![FileRef::from_bytes("f", vec![0u8; 16384 * 4])])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.toggle_pause());
        ch.buffered.store(0, Ordering::Release);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ch.binaries().len(), 1, "no chunk may leave while paused");

        assert!(!sender.toggle_pause());
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, BatchOutcome::Completed { files: 1, bytes: 16384 * 4 });
    }

    #[tokio::test]
    async fn small_files_ignore_pause() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sender = BatchSender::new(
            TransferConfig {
                min_pause_size: 1024 * 1024,
                ..config()
            },
            tx,
        );
        let ch = Arc::new(MockChannel::default());
        *ch.block_after.lock().unwrap() = Some((1, 200 * 1024));
        let task = {
            let sender = sender.clone();
            let ch = ch.clone();
            tokio::spawn(async move {
                sender
                    .send_batch(ch, vec![FileRef::from_bytes("f", vec![0u8; 16384 * 3])])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.toggle_pause();
        ch.buffered.store(0, Ordering::Release);
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, BatchOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn stop_mid_file_sends_cancel_and_skips_rest() {
        let (sender, mut rx) = sender();
        let ch = Arc::new(MockChannel::default());
        // Files 1 and 2 are two chunks each; block after the first chunk of file 3.
        *ch.block_after.lock().unwrap() = Some((5, 200 * 1024));
        let files = vec![
            FileRef::from_bytes("a", vec![1u8; 32768]),
            FileRef::from_bytes("b", vec![2u8; 32768]),
            FileRef::from_bytes("c", vec![3u8; 32768]),
        ];
        let task = {
            let sender = sender.clone();
            let ch = ch.clone();
            tokio::spawn(async move { sender.send_batch(ch, files).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sender.stop());

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, BatchOutcome::Stopped { files_sent: 2 });
        assert!(!sender.is_running());

        let controls: Vec<ControlMessage> = ch.messages().iter().filter_map(control).collect();
        assert_eq!(controls.last(), Some(&ControlMessage::CancelTransfer));
        assert_eq!(
            controls.iter().filter(|m| **m == ControlMessage::Done).count(),
            2
        );

        let mut stopped = false;
        while let Ok(ev) = rx.try_recv() {
            if let TransferEvent::SendStopped { files_sent } = ev {
                stopped = files_sent == 2;
            }
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn abort_does_not_notify_peer() {
        let (sender, _rx) = sender();
        let ch = Arc::new(MockChannel::default());
        *ch.block_after.lock().unwrap() = Some((1, 200 * 1024));
        let task = {
            let sender = sender.clone();
            let ch = ch.clone();
            tokio::spawn(async move {
                sender
                    .send_batch(ch, vec![FileRef::from_bytes("f", vec![0u8; 65536])])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.abort());
        task.await.unwrap().unwrap();
        let controls: Vec<ControlMessage> = ch.messages().iter().filter_map(control).collect();
        assert!(!controls.contains(&ControlMessage::CancelTransfer));
    }

    #[tokio::test]
    async fn channel_closing_mid_transfer_fails_batch() {
        let (sender, mut rx) = sender();
        let ch = Arc::new(MockChannel::default());
        *ch.block_after.lock().unwrap() = Some((1, 200 * 1024));
        let task = {
            let sender = sender.clone();
            let ch = ch.clone();
            tokio::spawn(async move {
                sender
                    .send_batch(ch, vec![FileRef::from_bytes("f", vec![0u8; 65536])])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.close().await;
        assert!(matches!(
            task.await.unwrap(),
            Err(TransferError::ChannelClosed)
        ));
        let mut failed = false;
        while let Ok(ev) = rx.try_recv() {
            failed |= matches!(ev, TransferEvent::SendFailed(_));
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn unreadable_source_aborts_batch() {
        let (sender, _rx) = sender();
        let ch = Arc::new(MockChannel::default());
        let missing = FileRef {
            name: "gone".into(),
            size: 10,
            source: super::super::batch::FileSource::Path("/nonexistent/rtcportal/gone".into()),
        };
        assert!(matches!(
            sender.send_batch(ch, vec![missing]).await,
            Err(TransferError::Read { .. })
        ));
        assert!(!sender.is_running());
    }

    #[tokio::test]
    async fn progress_ends_at_100() {
        let (sender, mut rx) = sender();
        let ch = Arc::new(MockChannel::default());
        sender
            .send_batch(
                ch,
                vec![
                    FileRef::from_bytes("a", vec![0u8; 20000]),
                    FileRef::from_bytes("b", vec![0u8; 30000]),
                ],
            )
            .await
            .unwrap();
        let mut last = 0;
        while let Ok(ev) = rx.try_recv() {
            if let TransferEvent::Progress(p) = ev {
                assert!(p.percent >= last);
                last = p.percent;
            }
        }
        assert_eq!(last, 100);
    }
}
