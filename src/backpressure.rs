//! Backpressure for outbound frames.
//!
//! Each connection has one writer task. Sessions reserve a slot before
//! queueing a frame and the writer task releases slots once frames hit the
//! socket. When `max_pending` frames are in flight, senders wait (up to a
//! timeout) for the writer to catch up, so a slow peer cannot make a fast
//! handler buffer without bound.
//!
//! # Configuration
//!
//! - `max_pending`: Maximum number of pending frames (default: 1024)
//! - `timeout`: How long to wait when backpressure is active (default: 5s)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{GreetError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Lock-free pending-frame counter shared by a writer task and its handles.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a controller with the default timeout.
    #[cfg(test)]
    pub fn new(max_pending: usize) -> Self {
        Self::with_timeout(max_pending, DEFAULT_TIMEOUT)
    }

    /// Create a controller with custom timeout.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            timeout,
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Try to reserve a slot without waiting.
    pub fn try_reserve(&self) -> Result<()> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| GreetError::Transport("write queue full".to_string()))
    }

    /// Reserve a slot, waiting while the queue is full.
    ///
    /// Fails with a transport error once the timeout elapses: a peer that
    /// stops reading for that long is treated as gone.
    pub async fn reserve(&self) -> Result<()> {
        if self.try_reserve().is_ok() {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            tokio::time::sleep(CHECK_INTERVAL).await;

            if self.try_reserve().is_ok() {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(GreetError::Transport(format!(
                    "peer not reading: {} frames pending for {:?}",
                    self.pending_count(),
                    self.timeout
                )));
            }
        }
    }

    /// Release a single slot.
    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Release multiple slots at once (after a batch write).
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_creation() {
        let ctrl = BackpressureController::new(100);
        assert_eq!(ctrl.max_pending, 100);
        assert_eq!(ctrl.pending_count(), 0);
        assert!(!ctrl.is_active());
    }

    #[test]
    fn test_try_reserve_until_full() {
        let ctrl = BackpressureController::new(5);

        for _ in 0..5 {
            ctrl.try_reserve().unwrap();
        }

        assert!(ctrl.is_active());
        assert!(matches!(ctrl.try_reserve(), Err(GreetError::Transport(_))));
    }

    #[test]
    fn test_release() {
        let ctrl = BackpressureController::new(10);

        ctrl.try_reserve().unwrap();
        ctrl.try_reserve().unwrap();
        ctrl.release();
        assert_eq!(ctrl.pending_count(), 1);

        ctrl.release_many(1);
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_clones_share_counter() {
        let ctrl = BackpressureController::new(10);
        let other = ctrl.clone();

        ctrl.try_reserve().unwrap();
        assert_eq!(other.pending_count(), 1);
        other.release();
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reserve_immediate_when_free() {
        let ctrl = BackpressureController::new(1);
        ctrl.reserve().await.unwrap();
        assert_eq!(ctrl.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_waits_for_release() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(1));
        ctrl.try_reserve().unwrap();

        let releaser = ctrl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release();
        });

        ctrl.reserve().await.unwrap();
        assert_eq!(ctrl.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_times_out() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_millis(5));
        ctrl.try_reserve().unwrap();

        let result = ctrl.reserve().await;
        assert!(matches!(result, Err(GreetError::Transport(_))));
    }
}
