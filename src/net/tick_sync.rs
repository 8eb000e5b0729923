//! Tick adjustment protocol
//!
//! The server measures how early each client's messages arrive
//! (`received tick - current tick`) and periodically tells the client to run
//! extra ticks or withhold some. Adjustments are numbered; a client message
//! carrying an old iteration was sent before the client applied the latest
//! adjustment, so its sample is discarded.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use super::NetworkError;
use crate::game::constants::sync::{
    MIN_FRESH_DIFFS, TICKDIFF_ACCEPTABLE_HIGH, TICKDIFF_ACCEPTABLE_LOW, TICKDIFF_HISTORY_LENGTH,
    TICKDIFF_TARGET,
};
use crate::util::circular_buffer::CircularBuffer;

fn in_band(diff: i32) -> bool {
    (TICKDIFF_ACCEPTABLE_LOW..=TICKDIFF_ACCEPTABLE_HIGH).contains(&diff)
}

/// Rolling window of tick diffs, newest at index 0
#[derive(Debug, Clone, Default)]
pub struct TickDiffHistory {
    diffs: CircularBuffer<i32, TICKDIFF_HISTORY_LENGTH>,
    /// Samples pushed since the last adjustment
    fresh: usize,
}

impl TickDiffHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diff: i32) {
        self.diffs.push(diff);
        self.fresh = (self.fresh + 1).min(TICKDIFF_HISTORY_LENGTH);
    }

    pub fn fresh_count(&self) -> usize {
        self.fresh
    }

    pub fn latest(&self) -> i32 {
        self.diffs[0]
    }

    /// Mean of the fresh samples, truncated toward zero
    pub fn fresh_mean(&self) -> Option<i32> {
        if self.fresh == 0 {
            return None;
        }
        let sum: i64 = self.diffs.iter().take(self.fresh).map(|&d| d as i64).sum();
        Some((sum / self.fresh as i64) as i32)
    }

    pub fn mark_stale(&mut self) {
        self.fresh = 0;
    }
}

/// Adjustment the client should apply, or zero to leave it alone
pub fn compute_adjustment(history: &TickDiffHistory) -> Result<i8, NetworkError> {
    if history.fresh_count() < MIN_FRESH_DIFFS {
        return Ok(0);
    }

    let latest = history.latest();
    if in_band(latest) {
        return Ok(0);
    }

    let Some(mean) = history.fresh_mean() else {
        return Ok(0);
    };
    if in_band(mean) {
        return Ok(0);
    }

    // Running ahead but already recovering: a transient spike
    let previous = history.diffs[1];
    if latest < TICKDIFF_TARGET && latest > previous {
        return Ok(0);
    }

    let adjustment = TICKDIFF_TARGET - mean;
    i8::try_from(adjustment).map_err(|_| NetworkError::AdjustmentOutOfRange(adjustment))
}

// ============================================================================
// Server side
// ============================================================================

/// Per-connection adjustment state on the server. `record` is called from
/// the session's receive thread, `take_adjustment` from the send path.
#[derive(Debug, Default)]
pub struct TickAdjustmentSender {
    history: Mutex<TickDiffHistory>,
    iteration: AtomicU8,
}

impl TickAdjustmentSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diff from a client batch tagged with `client_iteration`.
    /// Returns false if the sample predates the latest adjustment.
    pub fn record(&self, diff: i32, client_iteration: u8) -> bool {
        if client_iteration != self.iteration.load(Ordering::Acquire) {
            return false;
        }
        self.history.lock().push(diff);
        true
    }

    /// Adjustment and iteration to put in the next batch header
    pub fn take_adjustment(&self) -> Result<(i8, u8), NetworkError> {
        let mut history = self.history.lock();
        let adjustment = compute_adjustment(&history)?;
        if adjustment != 0 {
            self.iteration.fetch_add(1, Ordering::AcqRel);
            history.mark_stale();
        }
        Ok((adjustment, self.iteration.load(Ordering::Acquire)))
    }

    pub fn iteration(&self) -> u8 {
        self.iteration.load(Ordering::Acquire)
    }
}

// ============================================================================
// Client side
// ============================================================================

#[derive(Debug, Default)]
struct ReceivedAdjustments {
    /// Latest iteration seen in a server header
    received_iteration: u8,
    /// Iteration whose adjustment the tick loop has taken. Echoed to the
    /// server so its samples only count once the scheduler has moved.
    applied_iteration: u8,
    pending: i32,
}

/// Adjustments received from the server, waiting for the tick loop
#[derive(Debug, Default)]
pub struct TickAdjustmentReceiver {
    state: Mutex<ReceivedAdjustments>,
    /// Server tick diffs seen by this client, for diagnostics
    history: Mutex<TickDiffHistory>,
}

impl TickAdjustmentReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch header's adjustment fields. A nonzero adjustment must
    /// carry the next iteration; a zero one must repeat the current one.
    pub fn receive(&self, adjustment: i8, iteration: u8) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        let expected = if adjustment != 0 {
            state.received_iteration.wrapping_add(1)
        } else {
            state.received_iteration
        };
        if iteration != expected {
            return Err(NetworkError::AdjustmentIterationMismatch {
                expected,
                received: iteration,
            });
        }
        if adjustment != 0 {
            state.received_iteration = iteration;
            state.pending += adjustment as i32;
        }
        Ok(())
    }

    /// Iteration echoed in every client batch header
    pub fn iteration(&self) -> u8 {
        self.state.lock().applied_iteration
    }

    /// Drain the accumulated adjustment into the tick scheduler. From here on
    /// the client reports the iteration it belongs to.
    pub fn take_pending(&self) -> i32 {
        let mut state = self.state.lock();
        state.applied_iteration = state.received_iteration;
        std::mem::take(&mut state.pending)
    }

    pub fn record_diff(&self, diff: i32) {
        self.history.lock().push(diff);
    }

    pub fn mean_diff(&self) -> Option<i32> {
        self.history.lock().fresh_mean()
    }
}
