//! Ordered buffer for remote candidates that arrive before an endpoint exists.

use crate::protocol::IceCandidate;

use std::collections::VecDeque;

/// FIFO of candidates awaiting an endpoint binding.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Take every buffered candidate in arrival order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n}"), "0", 0)
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        for n in 0..5 {
            buffer.push(candidate(n));
        }
        assert_eq!(buffer.len(), 5);

        let drained = buffer.drain();
        let names: Vec<_> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(
            names,
            vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_empty() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_clear_discards() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
