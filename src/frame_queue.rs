//! Bounded "freshest frame wins" hand-off queue.
//!
//! Moves frames from the capture stage to the recognition stage. The buffer
//! holds at most two frames; producers never block and consumers only ever
//! see the most recent frame. Bounded latency is preferred over completeness:
//! when recognition is slower than capture, intermediate frames are
//! intentionally discarded.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Hard cap on buffered items
const MAX_CAPACITY: usize = 2;

/// Capacity-bounded most-recent-wins queue.
///
/// The single mutex is held only for the enqueue/drain itself; no blocking or
/// callback work ever runs inside the lock.
#[derive(Debug)]
pub struct FreshestFrameQueue<T> {
    buf: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> FreshestFrameQueue<T> {
    /// Create a queue with the given capacity, clamped to 1..=2
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(MAX_CAPACITY)),
            capacity: capacity.clamp(1, MAX_CAPACITY),
        }
    }

    /// Enqueue a new item, evicting the oldest first when at capacity.
    /// Never blocks.
    pub fn put(&self, item: T) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        while buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(item);
    }

    /// Take the most recently put item and clear any backlog.
    ///
    /// Returns `None` if nothing was put since the previous `get_latest`.
    pub fn get_latest(&self) -> Option<T> {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let latest = buf.pop_back();
        buf.clear();
        latest
    }

    /// Current number of buffered items (diagnostics only)
    pub fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for FreshestFrameQueue<T> {
    fn default() -> Self {
        Self::new(MAX_CAPACITY)
    }
}
