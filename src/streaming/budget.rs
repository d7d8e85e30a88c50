//! Per-frame work budgets for streaming
//!
//! Loading and encoding are spread across frames so that a burst of tiles
//! never stalls the real-time loop. Both budgets suspend on the
//! [`FrameClock`] rather than blocking a thread.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::time::FrameClock;

/// Caps the number of tile loads that may start in a single frame.
///
/// Shared by every load task of a stream.
pub struct FrameLoadBudget {
    max_per_frame: usize,
    /// (frame, loads started in that frame)
    state: Mutex<(u64, usize)>,
}

impl FrameLoadBudget {
    /// Create a budget. A cap of zero is treated as one load per frame.
    pub fn new(max_per_frame: usize) -> Self {
        Self {
            max_per_frame: max_per_frame.max(1),
            state: Mutex::new((0, 0)),
        }
    }

    pub fn max_per_frame(&self) -> usize {
        self.max_per_frame
    }

    /// Try to count one load against the current frame
    pub fn try_acquire(&self, frame: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.0 != frame {
            *state = (frame, 0);
        }
        if state.1 < self.max_per_frame {
            state.1 += 1;
            true
        } else {
            false
        }
    }

    /// Count one load, suspending until a later frame if this frame's cap is reached.
    pub async fn acquire(&self, clock: &FrameClock) {
        loop {
            let frame = clock.frame();
            if self.try_acquire(frame) {
                return;
            }
            clock.wait_for_frame_after(frame).await;
        }
    }

    /// Loads counted in `frame` so far
    pub fn used(&self, frame: u64) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.0 == frame { state.1 } else { 0 }
    }
}

/// Time and item budget for one tile encode.
///
/// Checked after every record; once either limit is hit the encoder waits for
/// the next frame and starts a fresh checkpoint. The item cap is the number of
/// records written per frame: the wait starts as soon as the count reaches
/// it, so no frame ever writes more than `max_items`. Time is checked against
/// the checkpoint and must be exceeded.
pub struct EncodeBudget {
    max_time: Duration,
    max_items: usize,
    checkpoint: Instant,
    items: usize,
    yields: u32,
}

impl EncodeBudget {
    pub fn new(max_time: Duration, max_items: usize) -> Self {
        Self {
            max_time,
            max_items: max_items.max(1),
            checkpoint: Instant::now(),
            items: 0,
            yields: 0,
        }
    }

    /// Budget that never yields (tools, tests, shutdown flushes)
    pub fn unlimited() -> Self {
        Self::new(Duration::MAX, usize::MAX)
    }

    /// Whether accumulated work since the last checkpoint exhausts the budget
    pub fn is_exhausted(elapsed: Duration, items: usize, max_time: Duration, max_items: usize) -> bool {
        elapsed > max_time || items >= max_items
    }

    /// Record one encoded item; suspends until the next frame when over budget.
    pub async fn record_item(&mut self, clock: &FrameClock) {
        self.items += 1;
        if Self::is_exhausted(self.checkpoint.elapsed(), self.items, self.max_time, self.max_items) {
            self.yields += 1;
            clock.next_frame().await;
            self.reset();
        }
    }

    /// Start a fresh checkpoint
    pub fn reset(&mut self) {
        self.checkpoint = Instant::now();
        self.items = 0;
    }

    /// Number of frame boundaries this budget waited on
    pub fn yields(&self) -> u32 {
        self.yields
    }
}
