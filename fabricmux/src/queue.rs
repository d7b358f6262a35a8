//! A closable, bounded-in-spirit byte queue used as each stream's receive
//! buffer.
//!
//! Storage is a lock-free [`SegQueue`] so the producer (the fabric reader
//! loop) never blocks on `push` — back-pressure is expressed to the peer via
//! `WND` credits, not by stalling the demultiplexer. A small [`Mutex`] +
//! [`Condvar`] pair, touched only around the wake handshake, gives the
//! consumer a blocking `pop` without the classic "condvar with no associated
//! mutex" hazard: every check of the queue's state and every `wait` happens
//! while holding the same lock, so a `push` that races a `pop` can never be
//! missed.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::error::{FabricError, Result};

pub struct ByteQueue {
    chunks: SegQueue<Bytes>,
    closed: AtomicBool,
    wake: Mutex<()>,
    condvar: Condvar,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            chunks: SegQueue::new(),
            closed: AtomicBool::new(false),
            wake: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Enqueue a chunk. Never blocks. Fails if the queue has already been
    /// closed; callers on the producer side (the fabric reader) treat that
    /// as "discard silently", per the receive-queue invariant.
    pub fn push(&self, chunk: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::QueueClosed);
        }
        self.chunks.push(chunk);
        let _guard = self.wake.lock();
        self.condvar.notify_one();
        Ok(())
    }

    /// Pop one chunk. If `blocking` is true and the queue is currently
    /// empty but not closed, waits for a push or a close.
    ///
    /// Returns `Ok(Some(chunk))` on data, `Ok(None)` on a non-blocking empty
    /// read, and `Err(QueueClosed)` once the queue is closed and fully
    /// drained.
    pub fn pop(&self, blocking: bool) -> Result<Option<Bytes>> {
        let mut guard = self.wake.lock();
        loop {
            if let Some(chunk) = self.chunks.pop() {
                return Ok(Some(chunk));
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(FabricError::QueueClosed);
            }
            if !blocking {
                return Ok(None);
            }
            self.condvar.wait(&mut guard);
        }
    }

    /// Idempotent close. Wakes every blocked consumer; each will drain any
    /// remaining buffered chunks before observing `QueueClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.wake.lock();
        self.condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_then_pop() {
        let q = ByteQueue::new();
        q.push(Bytes::from_static(b"a")).unwrap();
        q.push(Bytes::from_static(b"b")).unwrap();
        assert_eq!(q.pop(false).unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(q.pop(false).unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(q.pop(false).unwrap().is_none());
    }

    #[test]
    fn close_drains_before_signalling_closed() {
        let q = ByteQueue::new();
        q.push(Bytes::from_static(b"buffered")).unwrap();
        q.close();
        assert_eq!(
            q.pop(true).unwrap().unwrap(),
            Bytes::from_static(b"buffered")
        );
        assert!(matches!(q.pop(true), Err(FabricError::QueueClosed)));
    }

    #[test]
    fn push_after_close_is_rejected() {
        let q = ByteQueue::new();
        q.close();
        assert!(matches!(
            q.push(Bytes::from_static(b"late")),
            Err(FabricError::QueueClosed)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let q = ByteQueue::new();
        q.close();
        q.close();
        assert!(q.is_closed());
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let q = Arc::new(ByteQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop(true).unwrap());

        thread::sleep(Duration::from_millis(20));
        q.push(Bytes::from_static(b"woke")).unwrap();

        let popped = handle.join().unwrap();
        assert_eq!(popped, Some(Bytes::from_static(b"woke")));
    }

    #[test]
    fn blocking_pop_wakes_on_close() {
        let q = Arc::new(ByteQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop(true));

        thread::sleep(Duration::from_millis(20));
        q.close();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(FabricError::QueueClosed)));
    }
}
