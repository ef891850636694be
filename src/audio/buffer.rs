//! Bounded frame queue with drop-oldest backpressure
//!
//! Producers never block: when the queue is full the oldest frames are
//! discarded to make room, so memory stays bounded no matter how slow the
//! consumer is. A single consumer awaits frames with [`FrameQueue::pop`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::protocol::Frame;

struct Inner {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Bounded FIFO of shared frames
pub struct FrameQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
    pushed_count: AtomicU64,
    dropped_count: AtomicU64,
}

impl FrameQueue {
    /// Create a new queue holding at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
            pushed_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Append a frame, evicting the oldest entries if at capacity.
    /// Frames pushed after [`FrameQueue::close`] are discarded.
    pub fn push(&self, frame: Frame) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            while inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
            }
            inner.frames.push_back(frame);
        }
        self.pushed_count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Wait for the oldest frame. Returns `None` once the queue is closed
    /// and empty.
    pub async fn pop(&self) -> Option<Frame> {
        self.pop_with(|frames| frames.pop_front()).await
    }

    /// Wait for a frame, then discard everything but the newest and return
    /// it. Used by playback paths that must not replay stale audio after a
    /// stall.
    pub async fn pop_latest(&self) -> Option<Frame> {
        self.pop_with(|frames| {
            let latest = frames.pop_back();
            if latest.is_some() && !frames.is_empty() {
                self.dropped_count
                    .fetch_add(frames.len() as u64, Ordering::Relaxed);
                frames.clear();
            }
            latest
        })
        .await
    }

    async fn pop_with<F>(&self, mut take: F) -> Option<Frame>
    where
        F: FnMut(&mut VecDeque<Frame>) -> Option<Frame>,
    {
        loop {
            // Register interest before checking so a push or close between
            // the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(frame) = take(&mut inner.frames) {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking pop of the oldest frame
    pub fn try_pop(&self) -> Option<Frame> {
        self.inner.lock().frames.pop_front()
    }

    /// Take every queued frame in one critical section, leaving the queue
    /// empty. Frames pushed concurrently land either in the result or in
    /// the queue afterwards, never both.
    pub fn drain(&self) -> Vec<Frame> {
        let frames = std::mem::take(&mut self.inner.lock().frames);
        frames.into()
    }

    /// Discard all queued frames
    pub fn clear(&self) {
        self.inner.lock().frames.clear();
    }

    /// Wake every waiting consumer; later pops on an empty queue return
    /// `None` instead of waiting.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        // Covers a consumer that is between `enable` and the lock.
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames accepted by [`FrameQueue::push`]
    pub fn pushed_count(&self) -> u64 {
        self.pushed_count.load(Ordering::Relaxed)
    }

    /// Frames discarded by backpressure
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }
}

/// Thread-safe handle to a frame queue
pub type SharedFrameQueue = Arc<FrameQueue>;

/// Create a new shared frame queue
pub fn create_shared_queue(capacity: usize) -> SharedFrameQueue {
    Arc::new(FrameQueue::new(capacity))
}
