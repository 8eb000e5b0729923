//! Tick-indexed sorting of inbound messages
//!
//! Messages tagged with a tick are parked in the bucket for that tick until
//! the simulation reaches it. Only ticks in `[current, current + W)` are
//! accepted.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::game::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityStatus {
    /// Arrived after its tick was processed
    TooLow,
    Valid,
    /// Arrived more than a window ahead of the current tick
    TooHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushResult {
    pub status: ValidityStatus,
    /// `tick - current_tick`
    pub diff: i32,
}

impl PushResult {
    pub fn is_valid(&self) -> bool {
        self.status == ValidityStatus::Valid
    }
}

/// Single-threaded sorter. Feed it from one thread, or through a channel.
#[derive(Debug)]
pub struct TickSorter<T, const W: usize> {
    buckets: [VecDeque<T>; W],
    current_tick: Tick,
    /// Bucket holding `current_tick`
    cursor: usize,
}

impl<T, const W: usize> TickSorter<T, W> {
    pub fn new(current_tick: Tick) -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::new()),
            current_tick,
            cursor: 0,
        }
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn push(&mut self, item: T, tick: Tick) -> PushResult {
        let diff = tick.wrapping_sub(self.current_tick) as i32;
        let status = if diff < 0 {
            ValidityStatus::TooLow
        } else if diff as usize >= W {
            ValidityStatus::TooHigh
        } else {
            ValidityStatus::Valid
        };
        if status == ValidityStatus::Valid {
            self.buckets[(self.cursor + diff as usize) % W].push_back(item);
        }
        PushResult { status, diff }
    }

    /// Take everything queued for the current tick, in arrival order
    pub fn drain_current(&mut self) -> impl Iterator<Item = T> + '_ {
        self.buckets[self.cursor].drain(..)
    }

    /// Items waiting for the current tick
    pub fn current_len(&self) -> usize {
        self.buckets[self.cursor].len()
    }

    /// Move the window forward one tick. Anything left in the current
    /// bucket is discarded.
    pub fn advance(&mut self) {
        self.buckets[self.cursor].clear();
        self.cursor = (self.cursor + 1) % W;
        self.current_tick = self.current_tick.wrapping_add(1);
    }

    /// Jump to `tick`, dropping everything queued
    pub fn set_current_tick(&mut self, tick: Tick) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.current_tick = tick;
    }
}

/// Sorter shared between a receive thread (producer) and the simulation
/// thread (consumer)
#[derive(Debug)]
pub struct SyncTickSorter<T, const W: usize> {
    inner: Mutex<TickSorter<T, W>>,
    current_tick: AtomicU32,
}

impl<T, const W: usize> SyncTickSorter<T, W> {
    pub fn new(current_tick: Tick) -> Self {
        Self {
            inner: Mutex::new(TickSorter::new(current_tick)),
            current_tick: AtomicU32::new(current_tick),
        }
    }

    /// Readable without taking the lock
    pub fn current_tick(&self) -> Tick {
        self.current_tick.load(Ordering::Acquire)
    }

    pub fn push(&self, item: T, tick: Tick) -> PushResult {
        self.inner.lock().push(item, tick)
    }

    /// Take the current tick's items and advance the window
    pub fn drain_and_advance(&self) -> Vec<T> {
        let mut sorter = self.inner.lock();
        let items: Vec<T> = sorter.drain_current().collect();
        sorter.advance();
        self.current_tick.store(sorter.current_tick(), Ordering::Release);
        items
    }

    pub fn set_current_tick(&self, tick: Tick) {
        let mut sorter = self.inner.lock();
        sorter.set_current_tick(tick);
        self.current_tick.store(tick, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_window_boundaries() {
        let mut sorter: TickSorter<u32, 10> = TickSorter::new(55);
        assert_eq!(sorter.push(0, 50), PushResult { status: ValidityStatus::TooLow, diff: -5 });
        assert_eq!(sorter.push(0, 54).status, ValidityStatus::TooLow);
        assert_eq!(sorter.push(0, 55).status, ValidityStatus::Valid);
        assert_eq!(sorter.push(0, 64), PushResult { status: ValidityStatus::Valid, diff: 9 });
        assert_eq!(sorter.push(0, 65), PushResult { status: ValidityStatus::TooHigh, diff: 10 });
    }

    #[test]
    fn test_drain_in_tick_order() {
        let mut sorter: TickSorter<&str, 4> = TickSorter::new(0);
        sorter.push("b1", 1);
        sorter.push("a", 0);
        sorter.push("b2", 1);

        assert_eq!(sorter.drain_current().collect::<Vec<_>>(), vec!["a"]);
        sorter.advance();
        assert_eq!(sorter.current_len(), 2);
        assert_eq!(sorter.drain_current().collect::<Vec<_>>(), vec!["b1", "b2"]);
    }

    #[test]
    fn test_advance_reuses_bucket() {
        let mut sorter: TickSorter<u32, 3> = TickSorter::new(0);
        assert!(!sorter.push(1, 3).is_valid());
        sorter.advance();
        // Tick 3 now fits, in the slot tick 0 vacated
        assert!(sorter.push(3, 3).is_valid());
        assert_eq!(sorter.current_len(), 0);
        sorter.advance();
        sorter.advance();
        assert_eq!(sorter.drain_current().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_undrained_items_dropped_on_advance() {
        let mut sorter: TickSorter<u32, 3> = TickSorter::new(0);
        sorter.push(7, 0);
        sorter.advance();
        sorter.advance();
        sorter.advance();
        assert_eq!(sorter.current_len(), 0);
    }

    #[test]
    fn test_tick_wraparound() {
        let mut sorter: TickSorter<u32, 4> = TickSorter::new(u32::MAX);
        assert!(sorter.push(1, 1).is_valid());
        assert_eq!(sorter.push(1, u32::MAX - 1).status, ValidityStatus::TooLow);
    }

    #[test]
    fn test_buckets_stay_in_order_across_wrap() {
        // 10 doesn't divide 2^32, so tick-derived slots would collide here
        let start = u32::MAX - 4;
        let mut sorter: TickSorter<u32, 10> = TickSorter::new(start);
        for offset in 0..10u32 {
            assert!(sorter.push(offset, start.wrapping_add(offset)).is_valid());
        }
        for offset in 0..10u32 {
            assert_eq!(sorter.current_tick(), start.wrapping_add(offset));
            assert_eq!(sorter.drain_current().collect::<Vec<_>>(), vec![offset]);
            sorter.advance();
        }
        // Slots freed while crossing the wrap are reusable
        assert!(sorter.push(99, 14).is_valid());
        for _ in 0..9 {
            assert_eq!(sorter.current_len(), 0);
            sorter.advance();
        }
        assert_eq!(sorter.current_tick(), 14);
        assert_eq!(sorter.drain_current().collect::<Vec<_>>(), vec![99]);
    }

    #[test]
    fn test_sync_sorter_across_threads() {
        let sorter = Arc::new(SyncTickSorter::<u32, 10>::new(100));
        let producer = {
            let sorter = sorter.clone();
            std::thread::spawn(move || {
                for tick in 100..105 {
                    assert!(sorter.push(tick, tick).is_valid());
                }
            })
        };
        producer.join().unwrap();

        for tick in 100..105 {
            assert_eq!(sorter.current_tick(), tick);
            assert_eq!(sorter.drain_and_advance(), vec![tick]);
        }
        assert_eq!(sorter.current_tick(), 105);

        sorter.set_current_tick(500);
        assert_eq!(sorter.push(0, 104).status, ValidityStatus::TooLow);
    }
}
