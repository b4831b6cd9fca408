//! Batch receiver.
//!
//! Purely message-driven: the session feeds it control messages and chunks
//! in arrival order and it emits [`TransferEvent`]s. Chunks accumulate in
//! memory until the file's `Done`; handing files to storage is the host's
//! business.

use super::batch::{CompletedBatch, ReceivedFile};
use super::progress::ThroughputMeter;
use super::{Direction, TransferConfig, TransferEvent};
use crate::core::error::ProtocolError;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct IncomingFile {
    name: String,
    size: u64,
    index: u32,
    total: u32,
    chunks: Vec<Bytes>,
    received: u64,
}

struct IncomingBatch {
    total: u32,
    meter: ThroughputMeter,
    current: Option<IncomingFile>,
    completed: Vec<ReceivedFile>,
}

pub struct BatchReceiver {
    config: TransferConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
    batch: Option<IncomingBatch>,
}

impl BatchReceiver {
    pub fn new(config: TransferConfig, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            config,
            events,
            batch: None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.batch.is_some()
    }

    /// Completed files of the running batch so far.
    pub fn completed_count(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.completed.len())
    }

    fn emit(&self, ev: TransferEvent) {
        let _ = self.events.send(ev);
    }

    pub fn on_metadata(
        &mut self,
        file_name: String,
        file_size: u64,
        batch_index: u32,
        batch_total: u32,
        total_batch_size: Option<u64>,
    ) {
        let total_batch_size = total_batch_size.unwrap_or(file_size);

        if batch_index <= 1 || self.batch.is_none() {
            if let Some(old) = self.batch.take() {
                warn!(
                    event = "stale_batch_discarded",
                    completed = old.completed.len(),
                    "New batch started before the previous one finished"
                );
            }
            self.batch = Some(IncomingBatch {
                total: batch_total.max(1),
                meter: ThroughputMeter::new(
                    total_batch_size,
                    self.config.progress_throttle,
                    self.config.speed_warmup,
                ),
                current: None,
                completed: Vec::new(),
            });
            info!(event = "batch_incoming", files = batch_total, bytes = total_batch_size);
        }

        let Some(batch) = self.batch.as_mut() else { return };
        if let Some(partial) = batch.current.take() {
            warn!(file = %partial.name, "metadata before done, discarding partial file");
        }
        debug!(file = %file_name, size = file_size, batch_index, batch_total, "receiving file");
        batch.current = Some(IncomingFile {
            name: file_name,
            size: file_size,
            index: batch_index.max(1),
            total: batch.total,
            chunks: Vec::new(),
            received: 0,
        });
    }

    pub fn on_chunk(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        let batch = self.batch.as_mut().ok_or(ProtocolError::UnexpectedChunk)?;
        let file = batch.current.as_mut().ok_or(ProtocolError::UnexpectedChunk)?;

        let len = data.len() as u64;
        file.received += len;
        file.chunks.push(data);
        batch.meter.advance(len);

        if batch.meter.should_emit() {
            let progress = batch
                .meter
                .snapshot(Direction::Receive, &file.name, file.index, file.total);
            self.emit(TransferEvent::Progress(progress));
        }
        Ok(())
    }

    /// Assemble the current file; finalize the batch after its last file.
    pub fn on_done(&mut self) -> Result<Option<CompletedBatch>, ProtocolError> {
        let batch = self.batch.as_mut().ok_or(ProtocolError::UnexpectedDone)?;
        let file = batch.current.take().ok_or(ProtocolError::UnexpectedDone)?;

        if file.received != file.size {
            warn!(
                file = %file.name,
                expected = file.size,
                received = file.received,
                "file size mismatch"
            );
        }
        let (index, total) = (file.index, file.total);
        let received = ReceivedFile::assemble(file.name, file.chunks);
        info!(event = "file_received", file = %received.name, size = received.size(), index, total);
        let ev = TransferEvent::FileReceived {
            name: received.name.clone(),
            size: received.size(),
            index,
            total,
        };
        batch.completed.push(received);
        self.emit(ev);

        if index < total {
            return Ok(None);
        }
        let done = self.finish(false);
        Ok(done)
    }

    /// Sender cancelled: keep completed files, drop the partial one.
    pub fn on_cancel(&mut self) -> Option<CompletedBatch> {
        let partial = self.batch.as_ref().and_then(|b| b.current.as_ref());
        if let Some(p) = partial {
            info!(file = %p.name, received = p.received, "discarding partial file");
        }
        self.finish(true)
    }

    fn finish(&mut self, cancelled: bool) -> Option<CompletedBatch> {
        let batch = self.batch.take()?;
        let done = CompletedBatch {
            files: batch.completed,
            cancelled,
        };
        if cancelled {
            info!(event = "batch_cancelled", kept = done.files.len(), "Sender cancelled transfer");
            self.emit(TransferEvent::ReceiveCancelled(done.clone()));
        } else {
            info!(event = "batch_received", files = done.files.len(), "Batch received");
            self.emit(TransferEvent::ReceiveCompleted(done.clone()));
        }
        Some(done)
    }

    /// Drop everything without emitting a completed batch.
    pub fn reset(&mut self) {
        if self.batch.take().is_some() {
            debug!("receiver state dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> (BatchReceiver, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BatchReceiver::new(TransferConfig::default(), tx), rx)
    }

    fn chunks_of(data: &[u8], size: usize) -> Vec<Bytes> {
        data.chunks(size).map(Bytes::copy_from_slice).collect()
    }

    #[test]
    fn reassembles_single_file() {
        let (mut rx, _events) = receiver();
        let data: Vec<u8> = (0..40960u32).map(|i| (i % 251) as u8).collect();
        rx.on_metadata("f.bin".into(), 40960, 1, 1, Some(40960));
        for c in chunks_of(&data, 16384) {
            rx.on_chunk(c).unwrap();
        }
        let batch = rx.on_done().unwrap().expect("single-file batch completes");
        assert_eq!(batch.files.len(), 1);
        assert_eq!(batch.files[0].size(), 40960);
        assert_eq!(&batch.files[0].data[..], &data[..]);
        assert!(!batch.is_combined());
        assert!(!rx.is_receiving());
    }

    #[test]
    fn chunk_without_file_is_protocol_error() {
        let (mut rx, _events) = receiver();
        assert_eq!(
            rx.on_chunk(Bytes::from_static(b"x")),
            Err(ProtocolError::UnexpectedChunk)
        );
        assert_eq!(rx.on_done(), Err(ProtocolError::UnexpectedDone));
    }

    #[test]
    fn multi_file_batch_is_combined() {
        let (mut rx, mut events) = receiver();
        rx.on_metadata("a".into(), 3, 1, 2, Some(6));
        rx.on_chunk(Bytes::from_static(b"aaa")).unwrap();
        assert!(rx.on_done().unwrap().is_none());
        rx.on_metadata("b".into(), 3, 2, 2, Some(6));
        rx.on_chunk(Bytes::from_static(b"bbb")).unwrap();
        let batch = rx.on_done().unwrap().unwrap();
        assert!(batch.is_combined());
        assert!(!batch.cancelled);

        let mut completed = false;
        while let Ok(ev) = events.try_recv() {
            completed |= matches!(ev, TransferEvent::ReceiveCompleted(_));
        }
        assert!(completed);
    }

    #[test]
    fn cancel_keeps_completed_files_only() {
        let (mut rx, _events) = receiver();
        rx.on_metadata("a".into(), 2, 1, 3, Some(6));
        rx.on_chunk(Bytes::from_static(b"aa")).unwrap();
        rx.on_done().unwrap();
        rx.on_metadata("b".into(), 2, 2, 3, Some(6));
        rx.on_chunk(Bytes::from_static(b"bb")).unwrap();
        rx.on_done().unwrap();
        rx.on_metadata("c".into(), 2, 3, 3, Some(6));
        rx.on_chunk(Bytes::from_static(b"c")).unwrap();

        let batch = rx.on_cancel().unwrap();
        assert!(batch.cancelled);
        let names: Vec<_> = batch.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(rx.on_cancel().is_none());
    }

    #[test]
    fn first_index_resets_stale_batch() {
        let (mut rx, _events) = receiver();
        rx.on_metadata("old".into(), 4, 1, 2, Some(8));
        rx.on_chunk(Bytes::from_static(b"oooo")).unwrap();
        rx.on_done().unwrap();
        assert_eq!(rx.completed_count(), 1);

        rx.on_metadata("new".into(), 2, 1, 1, None);
        assert_eq!(rx.completed_count(), 0);
        rx.on_chunk(Bytes::from_static(b"nn")).unwrap();
        let batch = rx.on_done().unwrap().unwrap();
        assert_eq!(batch.files.len(), 1);
        assert_eq!(batch.files[0].name, "new");
    }

    #[test]
    fn reset_emits_nothing() {
        let (mut rx, mut events) = receiver();
        rx.on_metadata("a".into(), 2, 1, 1, None);
        rx.reset();
        assert!(!rx.is_receiving());
        while let Ok(ev) = events.try_recv() {
            assert!(!matches!(
                ev,
                TransferEvent::ReceiveCompleted(_) | TransferEvent::ReceiveCancelled(_)
            ));
        }
    }
}
