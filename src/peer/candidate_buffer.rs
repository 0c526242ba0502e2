use std::collections::VecDeque;

use crate::proto::IceCandidate;

/// [`IceCandidate`] received before the connection could consume it,
/// tagged with its arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
struct QueuedCandidate {
    arrival: u64,
    candidate: IceCandidate,
}

/// FIFO of [`IceCandidate`]s waiting for a remote description.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<QueuedCandidate>,
    arrivals: u64,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.arrivals += 1;
        self.queue.push_back(QueuedCandidate {
            arrival: self.arrivals,
            candidate,
        });
    }

    /// Takes every queued candidate in arrival order if a remote description
    /// is present. Otherwise returns [`None`] and leaves the queue as is.
    pub fn drain_if_ready(
        &mut self,
        has_remote_description: bool,
    ) -> Option<Vec<IceCandidate>> {
        if !has_remote_description {
            return None;
        }
        Some(self.queue.drain(..).map(|q| q.candidate).collect())
    }

    /// Arrival number of the oldest queued candidate.
    pub fn oldest_arrival(&self) -> Option<u64> {
        self.queue.front().map(|q| q.arrival)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(n: usize) -> Vec<IceCandidate> {
        (1..=n)
            .map(|i| IceCandidate::new(format!("candidate:{}", i)))
            .collect()
    }

    #[test]
    fn not_ready_keeps_queue() {
        let mut buffer = CandidateBuffer::new();
        candidates(2).into_iter().for_each(|c| buffer.enqueue(c));

        assert_eq!(buffer.drain_if_ready(false), None);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn drains_in_arrival_order_once() {
        let mut buffer = CandidateBuffer::new();
        candidates(5).into_iter().for_each(|c| buffer.enqueue(c));

        assert_eq!(buffer.drain_if_ready(true), Some(candidates(5)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.drain_if_ready(true), Some(Vec::new()));
    }

    #[test]
    fn arrival_tags_keep_counting_after_drain() {
        let mut buffer = CandidateBuffer::new();
        buffer.enqueue(IceCandidate::new("candidate:1"));
        buffer.drain_if_ready(true);
        buffer.enqueue(IceCandidate::new("candidate:2"));

        assert_eq!(buffer.oldest_arrival(), Some(2));
    }

    #[test]
    fn clear_drops_everything() {
        let mut buffer = CandidateBuffer::new();
        candidates(3).into_iter().for_each(|c| buffer.enqueue(c));

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.oldest_arrival(), None);
    }
}
