//! Bounded frame queue between the capture callback and the processing loop
//!
//! Pushes never wait for the consumer: when the queue is full the oldest
//! frame is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::audio::frame::Frame;

/// Result of a push into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued without loss
    Queued,
    /// Frame queued, the oldest queued frame was dropped to make room
    DroppedOldest,
    /// Queue is closed, frame discarded
    Closed,
}

pub struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        FrameQueue {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a frame, evicting the oldest one when full
    pub fn push(&self, frame: Frame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut frames = self.lock();
            let outcome = if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            frames.push_back(frame);
            outcome
        };

        self.available.notify_one();
        outcome
    }

    /// Dequeue the oldest frame, waiting up to `timeout` while empty.
    /// Returns `None` on timeout or once the queue is closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.lock();

        loop {
            if let Some(frame) = frames.pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let (guard, _) = self
                .available
                .wait_timeout(frames, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            frames = guard;
        }
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    /// Reject further pushes and wake any waiting consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_all();
    }

    /// Accept pushes again after a `close`
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard all queued frames
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total frames evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
