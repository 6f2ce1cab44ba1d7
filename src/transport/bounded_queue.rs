//! Bounded per-peer send queues
//!
//! Every connected peer gets one bounded outbound queue between the router
//! and its writer task. A full queue fails the send immediately with
//! `RouteError::Congested` instead of buffering without limit; the router
//! decides whether to re-route.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, PeerError, Result, RouteError};

/// One frame waiting to be written to a peer socket
#[derive(Debug)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    pub enqueued_at: Instant,
}

/// Counters for one peer's send queue
#[derive(Debug, Clone, Default)]
pub struct SendQueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub high_water: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    depth: AtomicUsize,
    high_water: AtomicUsize,
}

/// Sending half of a peer's outbound queue
#[derive(Clone)]
pub struct PeerSendQueue {
    sender: mpsc::Sender<OutboundFrame>,
    counters: Arc<Counters>,
    capacity: usize,
}

/// Receiving half, owned by the peer's writer task
pub struct PeerSendQueueReceiver {
    receiver: mpsc::Receiver<OutboundFrame>,
    counters: Arc<Counters>,
}

/// Create the queue pair for one peer connection
pub fn send_queue(capacity: usize) -> (PeerSendQueue, PeerSendQueueReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    let counters = Arc::new(Counters::default());
    (
        PeerSendQueue {
            sender,
            counters: counters.clone(),
            capacity,
        },
        PeerSendQueueReceiver { receiver, counters },
    )
}

impl PeerSendQueue {
    /// Enqueue a frame without waiting. Fails fast when the queue is full
    /// or the writer task is gone.
    pub fn try_enqueue(&self, bytes: Vec<u8>) -> Result<()> {
        let frame = OutboundFrame {
            bytes: Bytes::from(bytes),
            enqueued_at: Instant::now(),
        };
        match self.sender.try_send(frame) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                let depth = self.counters.depth.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.high_water.fetch_max(depth, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::Route(RouteError::Congested))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Peer(PeerError::Dropped)),
        }
    }

    pub fn stats(&self) -> SendQueueStats {
        SendQueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            high_water: self.counters.high_water.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

impl PeerSendQueueReceiver {
    /// Next frame to write, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        let frame = self.receiver.recv().await;
        if frame.is_some() {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
            self.counters.depth.fetch_sub(1, Ordering::Relaxed);
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_dequeue_order() {
        let (queue, mut rx) = send_queue(8);
        queue.try_enqueue(vec![1]).unwrap();
        queue.try_enqueue(vec![2]).unwrap();

        assert_eq!(rx.recv().await.unwrap().bytes, vec![1]);
        assert_eq!(rx.recv().await.unwrap().bytes, vec![2]);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dequeued, 2);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast_with_congested() {
        let (queue, _rx) = send_queue(2);
        queue.try_enqueue(vec![0]).unwrap();
        queue.try_enqueue(vec![0]).unwrap();

        match queue.try_enqueue(vec![0]) {
            Err(Error::Route(RouteError::Congested)) => {}
            other => panic!("expected Congested, got {:?}", other),
        }
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.stats().high_water, 2);
    }

    #[tokio::test]
    async fn test_closed_receiver_reports_dropped_peer() {
        let (queue, rx) = send_queue(2);
        drop(rx);
        match queue.try_enqueue(vec![0]) {
            Err(Error::Peer(PeerError::Dropped)) => {}
            other => panic!("expected Dropped, got {:?}", other),
        }
    }
}
