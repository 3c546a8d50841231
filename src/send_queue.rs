//! Bounded per-connection send queue.
//!
//! A FIFO of outbound byte frames shared between the enqueueing side
//! (hub, rooms, handlers) and the connection's write loop.  The three
//! backpressure strategies need head eviction and caller suspension, so
//! this is a deque under a mutex with `Notify` wakeups rather than an
//! mpsc channel.
//!
//! Close semantics: `close()` is idempotent and wakes every waiter;
//! `pop` drains the remaining frames before yielding `None` so frames
//! accepted before the close still reach the wire.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity.
    Full,
    /// The queue has been closed; the connection is terminal.
    Closed,
}

struct Inner {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

pub struct SendQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Signaled when a frame arrives or the queue closes.
    readable: Notify,
    /// Signaled when space frees up or the queue closes.
    writable: Notify,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        SendQueue {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Non-blocking enqueue.
    pub fn try_push(&self, frame: Vec<u8>) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().expect("send queue poisoned");
        if inner.closed {
            return Err(EnqueueError::Closed);
        }
        if inner.frames.len() >= self.capacity {
            return Err(EnqueueError::Full);
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.readable.notify_one();
        Ok(())
    }

    /// Evict the oldest queued frame to make room, then enqueue.
    /// Returns the evicted frame (`None` when no eviction was needed).
    pub fn push_evict_oldest(&self, frame: Vec<u8>) -> Result<Option<Vec<u8>>, EnqueueError> {
        let mut inner = self.inner.lock().expect("send queue poisoned");
        if inner.closed {
            return Err(EnqueueError::Closed);
        }
        let evicted = if inner.frames.len() >= self.capacity {
            inner.frames.pop_front()
        } else {
            None
        };
        if inner.frames.len() >= self.capacity {
            // Capacity zero pathological case: nothing to evict into.
            return Err(EnqueueError::Full);
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.readable.notify_one();
        Ok(evicted)
    }

    /// Enqueue, suspending the caller while the queue is full.
    pub async fn push_blocking(&self, frame: Vec<u8>) -> Result<(), EnqueueError> {
        loop {
            {
                let mut inner = self.inner.lock().expect("send queue poisoned");
                if inner.closed {
                    return Err(EnqueueError::Closed);
                }
                if inner.frames.len() < self.capacity {
                    inner.frames.push_back(frame);
                    drop(inner);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            self.writable.notified().await;
        }
    }

    /// Dequeue one frame, waiting for one to arrive.  `None` once the
    /// queue is closed and fully drained.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut inner = self.inner.lock().expect("send queue poisoned");
                if let Some(frame) = inner.frames.pop_front() {
                    drop(inner);
                    self.writable.notify_one();
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Non-blocking dequeue, used by the write loop to coalesce frames.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        let frame = self
            .inner
            .lock()
            .expect("send queue poisoned")
            .frames
            .pop_front();
        if frame.is_some() {
            self.writable.notify_one();
        }
        frame
    }

    /// Close the queue and wake every waiter.  Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("send queue poisoned");
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Remove and return every queued frame (used when preserving state
    /// at teardown).
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().expect("send queue poisoned");
        inner.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("send queue poisoned").frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("send queue poisoned").closed
    }
}
