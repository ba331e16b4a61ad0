//! Per-table ingestion queue
//!
//! Producers hand envelopes to the table's writer through a bounded channel.
//! The sequence number is taken and the envelope sent under one lock, so
//! sequence order, queue order and file order are the same thing. `close`,
//! `pending` and `last_sequence` never take that lock, so they do not wait
//! behind a producer parked on a full queue.
//!
//! ```text
//! write() ─┐
//! write() ─┼─► lock ─► seq++ ─► bounded channel ─► writer thread ─► <table>.jsonl
//! write() ─┘            (blocks while full)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;

use crate::envelope::RawEnvelope;

/// How long a parked producer waits for room before looking at `closed` again
const SEND_SLICE: Duration = Duration::from_millis(10);

/// Why an envelope was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    /// The queue was closed for shutdown
    Closed,
    /// The writer is gone; the table can no longer persist anything
    Disconnected,
}

/// Bounded queue in front of one table's writer
pub(crate) struct IngestQueue {
    /// Next sequence to hand out; held across the send
    next_sequence: Mutex<u64>,
    last_sequence: AtomicU64,

    /// Dropped on close so the writer sees the channel disconnect
    sender: Mutex<Option<Sender<RawEnvelope>>>,
    closed: AtomicBool,
    capacity: usize,
}

impl IngestQueue {
    /// Create a queue whose first envelope gets `first_sequence`
    ///
    /// Returns the queue and the receiving end for the writer.
    pub(crate) fn bounded(capacity: usize, first_sequence: u64) -> (Self, Receiver<RawEnvelope>) {
        let (sender, receiver) = channel::bounded(capacity);
        let queue = Self {
            next_sequence: Mutex::new(first_sequence),
            last_sequence: AtomicU64::new(first_sequence.saturating_sub(1)),
            sender: Mutex::new(Some(sender)),
            closed: AtomicBool::new(false),
            capacity,
        };
        (queue, receiver)
    }

    /// Assign the next sequence number and enqueue the envelope built for it
    ///
    /// Blocks while the queue is full. Other producers for the same table
    /// wait on the lock meanwhile, which keeps acceptance order intact.
    /// A parked producer gives up with `Closed` once the queue is closed.
    /// A sequence number is only consumed when the send succeeds.
    pub(crate) fn enqueue<F>(&self, build: F) -> Result<u64, EnqueueError>
    where
        F: FnOnce(u64) -> RawEnvelope,
    {
        let mut next = self.next_sequence.lock();
        let sender = self.sender.lock().clone().ok_or(EnqueueError::Closed)?;

        let sequence = *next;
        let mut envelope = build(sequence);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(EnqueueError::Closed);
            }
            match sender.send_timeout(envelope, SEND_SLICE) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => envelope = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(EnqueueError::Disconnected),
            }
        }

        *next = sequence + 1;
        self.last_sequence.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    /// Stop accepting envelopes; the writer drains what is left and exits
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sender.lock().take();
    }

    /// Envelopes accepted but not yet taken by the writer
    pub(crate) fn pending(&self) -> usize {
        self.sender.lock().as_ref().map(|s| s.len()).unwrap_or(0)
    }

    /// Last sequence number handed out (0 = none)
    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn raw(sequence: u64) -> RawEnvelope {
        RawEnvelope {
            chain_id: "chain".to_string(),
            node_id: "node".to_string(),
            table: "t".to_string(),
            sequence,
            timestamp: Utc::now(),
            msg: json!({"n": sequence}),
        }
    }

    #[test]
    fn test_sequences_follow_queue_order() {
        let (queue, rx) = IngestQueue::bounded(10, 1);

        assert_eq!(queue.enqueue(raw).unwrap(), 1);
        assert_eq!(queue.enqueue(raw).unwrap(), 2);
        assert_eq!(queue.pending(), 2);

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(queue.last_sequence(), 2);
    }

    #[test]
    fn test_full_queue_blocks_instead_of_dropping() {
        let (queue, rx) = IngestQueue::bounded(1, 1);
        let queue = Arc::new(queue);

        queue.enqueue(raw).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(raw).unwrap())
        };

        // The second producer is parked until the consumer makes room
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(rx.recv().unwrap().sequence, 1);
        assert_eq!(producer.join().unwrap(), 2);
        assert_eq!(rx.recv().unwrap().sequence, 2);
    }

    #[test]
    fn test_concurrent_producers_get_unique_ordered_sequences() {
        let (queue, rx) = IngestQueue::bounded(8, 1);
        let queue = Arc::new(queue);

        let consumer = thread::spawn(move || rx.iter().map(|e| e.sequence).collect::<Vec<_>>());

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..50 {
                        queue.enqueue(raw).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let received = consumer.join().unwrap();
        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_closed_and_disconnected() {
        let (queue, rx) = IngestQueue::bounded(4, 1);
        queue.close();
        assert_eq!(queue.enqueue(raw), Err(EnqueueError::Closed));
        assert_eq!(queue.pending(), 0);
        drop(rx);

        let (queue, rx) = IngestQueue::bounded(4, 10);
        drop(rx);
        assert_eq!(queue.enqueue(raw), Err(EnqueueError::Disconnected));

        // A failed send does not burn a sequence number
        assert_eq!(queue.last_sequence(), 9);
    }

    #[test]
    fn test_close_does_not_wait_for_parked_producer() {
        let (queue, rx) = IngestQueue::bounded(1, 1);
        let queue = Arc::new(queue);
        queue.enqueue(raw).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(raw))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let pending = queue.pending();
                queue.close();
                let _ = done_tx.send(pending);
            });
        }
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);

        // The parked producer gives up without taking a sequence number
        assert_eq!(producer.join().unwrap(), Err(EnqueueError::Closed));
        assert_eq!(queue.last_sequence(), 1);

        // What was accepted before close still reaches the writer
        assert_eq!(rx.recv().unwrap().sequence, 1);
        assert!(rx.recv().is_err());
    }
}
