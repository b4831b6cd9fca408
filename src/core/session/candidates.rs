//! Remote candidates that arrived before the remote description.

use crate::core::protocol::relay::IceCandidate;

/// FIFO of candidates for one negotiation attempt. Drained exactly once,
/// right after the attempt's remote description is applied.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    items: Vec<IceCandidate>,
    flushed: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate. Returns it back when the queue was already
    /// flushed; the caller should apply it directly.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.flushed {
            return Some(candidate);
        }
        self.items.push(candidate);
        None
    }

    /// Everything queued, in arrival order. Empty on every later call.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.flushed = true;
        std::mem::take(&mut self.items)
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order_once() {
        let mut q = CandidateQueue::new();
        for c in ["c1", "c2", "c3"] {
            assert!(q.push(IceCandidate::new(c)).is_none());
        }
        assert_eq!(q.len(), 3);

        let drained: Vec<_> = q.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c1", "c2", "c3"]);
        assert!(q.drain().is_empty());
        assert!(q.is_flushed());
    }

    #[test]
    fn push_after_flush_hands_candidate_back() {
        let mut q = CandidateQueue::new();
        q.drain();
        let back = q.push(IceCandidate::new("late"));
        assert_eq!(back.map(|c| c.candidate).as_deref(), Some("late"));
        assert!(q.is_empty());
    }
}
