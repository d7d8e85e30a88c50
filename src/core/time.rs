//! Frame stepping for cooperative, per-frame budgeted work

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

struct ClockState {
    frame: AtomicU64,
    ticked: Notify,
}

/// Frame counter shared between the host loop and suspended streaming tasks.
///
/// The host calls [`FrameClock::tick`] once per frame. Tasks that exhausted a
/// per-frame budget await [`FrameClock::next_frame`] and resume on the next
/// tick instead of blocking a worker thread.
#[derive(Clone)]
pub struct FrameClock {
    state: Arc<ClockState>,
    started: Instant,
}

impl FrameClock {
    /// Create a clock at frame 0
    pub fn new() -> Self {
        Self {
            state: Arc::new(ClockState {
                frame: AtomicU64::new(0),
                ticked: Notify::new(),
            }),
            started: Instant::now(),
        }
    }

    /// Advance to the next frame and wake every task waiting on a frame boundary.
    ///
    /// Returns the new frame number.
    pub fn tick(&self) -> u64 {
        let frame = self.state.frame.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.ticked.notify_waiters();
        frame
    }

    /// Current frame number
    pub fn frame(&self) -> u64 {
        self.state.frame.load(Ordering::Acquire)
    }

    /// Time since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Suspend until the frame counter is strictly greater than `frame`.
    pub async fn wait_for_frame_after(&self, frame: u64) {
        loop {
            let notified = self.state.ticked.notified();
            tokio::pin!(notified);
            // Register before reading the counter so a tick in between is not missed
            notified.as_mut().enable();

            if self.frame() > frame {
                return;
            }
            notified.await;
        }
    }

    /// Suspend until the next frame boundary.
    pub async fn next_frame(&self) {
        self.wait_for_frame_after(self.frame()).await;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameClock")
            .field("frame", &self.frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_advances_frame() {
        let clock = FrameClock::new();
        assert_eq!(clock.frame(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.frame(), 2);
    }

    #[test]
    fn test_clones_share_counter() {
        let clock = FrameClock::new();
        let other = clock.clone();
        other.tick();
        assert_eq!(clock.frame(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_past_frame_returns_immediately() {
        let clock = FrameClock::new();
        clock.tick();
        clock.tick();
        clock.wait_for_frame_after(1).await;
    }

    #[tokio::test]
    async fn test_waiter_resumes_after_tick() {
        let clock = FrameClock::new();
        let start = clock.frame();
        let waiter = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.wait_for_frame_after(start).await;
                clock.frame()
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        clock.tick();
        let resumed_at = waiter.await.expect("waiter panicked");
        assert_eq!(resumed_at, 1);
    }
}
