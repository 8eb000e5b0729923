//! Cooperative fixed-timestep scheduling
//!
//! Each side runs its periodic tasks (simulation tick, network send) from one
//! loop. `TickScheduler` decides how many simulation ticks are due, including
//! any tick adjustment received from the server; `PeriodicCaller` drives the
//! fixed-rate tasks. The loop sleeps only when every task has slack.

use crate::game::constants::sim::MAX_TICKS_PER_PASS;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sleeping less than this isn't worth the scheduler round trip
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Ticks of backlog beyond which accumulated time is dropped rather than
/// caught up
const MAX_BACKLOG_TICKS: i64 = MAX_TICKS_PER_PASS as i64 * 4;

#[derive(Debug)]
pub struct TickScheduler {
    timestep: Duration,
    accumulator: Duration,
    last_update: Option<Instant>,
    /// Ticks to add to (positive) or withhold from (negative) upcoming passes
    pending_ticks: i64,
}

impl TickScheduler {
    pub fn new(timestep: Duration) -> Self {
        Self {
            timestep,
            accumulator: Duration::ZERO,
            last_update: None,
            pending_ticks: 0,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.last_update = Some(now);
        self.accumulator = Duration::ZERO;
    }

    /// Shift the target tick. Never touches the already-processed tick count:
    /// a negative adjustment only withholds future ticks.
    pub fn adjust(&mut self, ticks: i32) {
        self.pending_ticks += ticks as i64;
    }

    pub fn pending_ticks(&self) -> i64 {
        self.pending_ticks
    }

    /// Number of ticks to process now. May be zero, one, or several.
    pub fn ticks_to_process(&mut self, now: Instant) -> u32 {
        let Some(last) = self.last_update else {
            self.start(now);
            return 0;
        };
        self.accumulator += now.saturating_duration_since(last);
        self.last_update = Some(now);

        let elapsed_ticks = (self.accumulator.as_nanos() / self.timestep.as_nanos()) as i64;
        self.accumulator -= self.timestep * elapsed_ticks as u32;

        let due = elapsed_ticks + self.pending_ticks;
        if due <= 0 {
            self.pending_ticks = due;
            return 0;
        }

        let max = MAX_TICKS_PER_PASS as i64;
        if due > max {
            let backlog = due - max;
            if backlog > MAX_BACKLOG_TICKS {
                warn!("Tick loop fell {} ticks behind, dropping the backlog", backlog);
                self.pending_ticks = 0;
            } else {
                self.pending_ticks = backlog;
            }
            return max as u32;
        }

        self.pending_ticks = 0;
        due as u32
    }

    /// Time until at least one tick is due
    pub fn time_until_next_tick(&self, now: Instant) -> Duration {
        if self.pending_ticks > 0 {
            return Duration::ZERO;
        }
        let Some(last) = self.last_update else {
            return Duration::ZERO;
        };
        let withheld = self.timestep * self.pending_ticks.unsigned_abs() as u32;
        let elapsed = self.accumulator + now.saturating_duration_since(last);
        (self.timestep + withheld).saturating_sub(elapsed)
    }
}

/// Fires at a fixed rate. Missed periods are skipped rather than bunched.
#[derive(Debug)]
pub struct PeriodicCaller {
    period: Duration,
    next_call: Instant,
}

impl PeriodicCaller {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self { period, next_call: now }
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_call {
            return false;
        }
        self.next_call += self.period;
        if self.next_call <= now {
            self.next_call = now + self.period;
        }
        true
    }

    pub fn time_until_next(&self, now: Instant) -> Duration {
        self.next_call.saturating_duration_since(now)
    }
}

/// Sleep until the nearest task deadline, if every task has slack
pub fn sleep_for_slack(slack: impl IntoIterator<Item = Duration>) {
    let nearest = slack.into_iter().min().unwrap_or(Duration::ZERO);
    if nearest >= MIN_SLEEP {
        std::thread::sleep(nearest);
    }
}
