//! Synchronization primitives for the outbound pipeline
//!
//! Three small pieces carry the whole concurrency design:
//!
//! - [`DropOldestQueue`]: a bounded FIFO where a producer facing a full queue
//!   evicts the front element instead of blocking, so one stalled peer can
//!   never back-pressure the TUN reader and starve the others.
//! - [`Latch`]: a single-use per-element completion signal. The nonce
//!   sequencer arms it before submitting an element to the encryption queue,
//!   a worker releases it when the element is sealed, and the sequential
//!   sender waits on it. That is what lets encryption run out of order
//!   while egress stays in submission order.
//! - [`Signal`]: a capacity-one edge-triggered signal with nonblocking fire
//!   and drain, used for `new_keypair_arrived` and `flush_nonce_queue`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// A bounded MPMC FIFO with drop-oldest overflow semantics.
///
/// `push` never blocks: when the queue is full the front element is evicted
/// and handed back to the producer, which is responsible for marking it
/// dropped (and, for the encryption queue, releasing its latch so a waiting
/// sender unblocks).
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> DropOldestQueue<T> {
    /// Create a queue holding at most `capacity` elements
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an element, evicting the oldest if the queue is full.
    ///
    /// Returns the displaced element, which the caller must dispose of. When
    /// the queue is closed the pushed element itself comes straight back.
    #[must_use]
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Some(item);
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Pop the next element, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    // wake the next consumer in case more items are queued
                    if !inner.items.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Pop without waiting
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Remove and return every queued element
    #[must_use]
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().items.drain(..).collect()
    }

    /// Close the queue: pending pops drain the remainder, then observe `None`
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the queue has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current number of queued elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

/// A single-use completion signal attached to each work element.
///
/// Armed by the sequencer before the element enters the encryption queue,
/// released exactly once (by the worker that sealed the element, or by the
/// drop-oldest path when the element is evicted), awaited by the sender.
/// Waiting after release returns immediately.
#[derive(Debug)]
pub struct Latch {
    released: AtomicBool,
    notify: Notify,
}

impl Latch {
    /// Create a latch in the released (open) state
    #[must_use]
    pub fn new() -> Self {
        Self {
            released: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    /// Arm the latch; a subsequent `wait` blocks until `release`
    pub fn arm(&self) {
        self.released.store(false, Ordering::Release);
    }

    /// Release the latch, waking every waiter
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the latch has been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Wait until the latch is released
    pub async fn wait(&self) {
        loop {
            if self.released.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            // re-check: release may have landed between the load and notified()
            if self.released.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a connected [`Signal`] / [`SignalReceiver`] pair
#[must_use]
pub fn signal() -> (Signal, SignalReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (Signal { tx }, SignalReceiver { rx })
}

/// Sending half of a capacity-one edge-triggered signal
#[derive(Debug, Clone)]
pub struct Signal {
    tx: mpsc::Sender<()>,
}

impl Signal {
    /// Fire the signal; a no-op if one is already pending
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Receiving half of an edge-triggered signal
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<()>,
}

impl SignalReceiver {
    /// Discard any pending signal without waiting
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Wait for the signal to fire
    pub async fn wait(&mut self) {
        let _ = self.rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = DropOldestQueue::new(4);
        assert!(queue.push(1).is_none());
        assert!(queue.push(2).is_none());
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest() {
        let queue = DropOldestQueue::new(2);
        assert!(queue.push(1).is_none());
        assert!(queue.push(2).is_none());
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_push_and_drains() {
        let queue = DropOldestQueue::new(4);
        assert!(queue.push(1).is_none());
        queue.close();
        // pushed element comes straight back for disposal
        assert_eq!(queue.push(2), Some(2));
        // remaining items drain before the close is observed
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(DropOldestQueue::new(4));
        let q = Arc::clone(&queue);
        let popper = tokio::spawn(async move { q.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.push(42).is_none());
        assert_eq!(popper.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let queue = Arc::new(DropOldestQueue::<u32>::new(4));
        let q = Arc::clone(&queue);
        let popper = tokio::spawn(async move { q.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(popper.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drain() {
        let queue = DropOldestQueue::new(8);
        for i in 0..5 {
            assert!(queue.push(i).is_none());
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_latch_release_before_wait() {
        let latch = Latch::new();
        latch.arm();
        latch.release();
        // must not hang
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_latch_blocks_until_release() {
        let latch = Arc::new(Latch::new());
        latch.arm();

        let l = Arc::clone(&latch);
        let waiter = tokio::spawn(async move {
            l.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        latch.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_fire_and_drain() {
        let (tx, mut rx) = signal();
        tx.fire();
        tx.fire(); // coalesces with the pending one
        rx.drain();

        tx.fire();
        tokio::time::timeout(Duration::from_secs(1), rx.wait())
            .await
            .expect("signal should be pending");
    }
}
