//! # Dual-Mode Inbound Queue
//!
//! The multiplexer's in-queue is consumed from two worlds at once: blocking
//! callers on arbitrary OS threads and cooperative tasks on the event loop.
//! Both sides share one buffer. The blocking side waits on a condvar with
//! conventional timeout semantics; the cooperative side waits on a
//! readiness signal and re-checks the buffer, so a wakeup is never lost
//! between the check and the wait.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

/// Error raised when no envelope is available.
///
/// Returned by non-blocking dequeues on an empty queue, by blocking
/// dequeues whose timeout expired, and by cooperative dequeues once the
/// queue is closed and drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no envelope available")]
pub struct Empty;

#[derive(Debug)]
pub(crate) struct InboundQueue<T> {
    buffer: Mutex<VecDeque<T>>,
    readable: Condvar,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> InboundQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an item and wake one consumer on each side.
    pub(crate) fn push(&self, item: T) {
        self.buffer.lock().push_back(item);
        self.readable.notify_one();
        self.notify.notify_waiters();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Mark the end of the stream; consumers drain what is buffered and
    /// then observe [`Empty`].
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_all();
        self.notify.notify_waiters();
    }

    /// Clear the end-of-stream mark for a fresh connect cycle. Buffered
    /// items survive reconnects.
    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Synchronous dequeue.
    ///
    /// With `block` false the call returns immediately; otherwise it waits
    /// for an item, bounded by `timeout` when one is given.
    pub(crate) fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T, Empty> {
        let mut buffer = self.buffer.lock();
        if !block {
            return buffer.pop_front().ok_or(Empty);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(item) = buffer.pop_front() {
                return Ok(item);
            }
            if self.is_closed() {
                return Err(Empty);
            }
            match deadline {
                None => self.readable.wait(&mut buffer),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Empty);
                    }
                    let timed_out = self
                        .readable
                        .wait_for(&mut buffer, deadline - now)
                        .timed_out();
                    if timed_out && buffer.is_empty() {
                        return Err(Empty);
                    }
                }
            }
        }
    }

    /// Cooperative dequeue; resolves to [`Empty`] once the stream ends.
    pub(crate) async fn async_get(&self) -> Result<T, Empty> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.buffer.lock().pop_front() {
                return Ok(item);
            }
            if self.is_closed() {
                return Err(Empty);
            }
            notified.await;
        }
    }

    /// Cooperative wait for a non-empty queue without consuming. Also
    /// returns once the stream ends, so callers can observe [`Empty`]
    /// through a subsequent dequeue.
    pub(crate) async fn async_wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.buffer.lock().is_empty() || self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn non_blocking_get_on_empty_queue() {
        let queue: InboundQueue<u32> = InboundQueue::new();
        assert_eq!(queue.get(false, None), Err(Empty));
        queue.push(7);
        assert_eq!(queue.get(false, None), Ok(7));
    }

    #[test]
    fn blocking_get_times_out() {
        let queue: InboundQueue<u32> = InboundQueue::new();
        let started = Instant::now();
        assert_eq!(queue.get(true, Some(Duration::from_millis(50))), Err(Empty));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocking_get_sees_item_from_other_thread() {
        let queue = Arc::new(InboundQueue::new());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(11u32);
        });
        assert_eq!(queue.get(true, Some(Duration::from_secs(3))), Ok(11));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn async_get_wakes_on_push() {
        let queue = Arc::new(InboundQueue::new());
        let consumer = queue.clone();
        let task = tokio::spawn(async move { consumer.async_get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(5u32);
        assert_eq!(task.await.unwrap(), Ok(5));
    }

    #[tokio::test]
    async fn async_get_observes_close() {
        let queue = Arc::new(InboundQueue::<u32>::new());
        let consumer = queue.clone();
        let task = tokio::spawn(async move { consumer.async_get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(task.await.unwrap(), Err(Empty));
    }

    #[tokio::test]
    async fn async_wait_does_not_consume() {
        let queue = Arc::new(InboundQueue::new());
        queue.push(3u32);
        queue.async_wait().await;
        assert_eq!(queue.get(false, None), Ok(3));
    }

    #[test]
    fn drains_before_reporting_end_of_stream() {
        let queue: InboundQueue<u32> = InboundQueue::new();
        queue.push(1);
        queue.close();
        assert_eq!(queue.get(true, None), Ok(1));
        assert_eq!(queue.get(true, None), Err(Empty));
    }
}
