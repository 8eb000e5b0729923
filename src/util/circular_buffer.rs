//! Fixed-capacity ring buffer indexed by "pushes ago"
//!
//! Index 0 is always the most recently pushed value, index `N - 1` the oldest
//! one still retained. Used for input history and tick-diff history.

use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, PartialEq)]
pub struct CircularBuffer<T, const N: usize> {
    buffer: [T; N],
    /// Slot holding the most recent value
    head: usize,
}

impl<T: Default, const N: usize> CircularBuffer<T, N> {
    pub fn new() -> Self {
        assert!(N > 0, "CircularBuffer capacity must be non-zero");
        Self {
            buffer: std::array::from_fn(|_| T::default()),
            head: 0,
        }
    }
}

impl<T: Clone, const N: usize> CircularBuffer<T, N> {
    /// Create a buffer with every slot set to `value`
    pub fn filled(value: T) -> Self {
        assert!(N > 0, "CircularBuffer capacity must be non-zero");
        Self {
            buffer: std::array::from_fn(|_| value.clone()),
            head: 0,
        }
    }

    /// Overwrite every slot with `value`
    pub fn fill(&mut self, value: T) {
        for slot in self.buffer.iter_mut() {
            *slot = value.clone();
        }
    }
}

impl<T, const N: usize> CircularBuffer<T, N> {
    pub const CAPACITY: usize = N;

    /// Push a value, overwriting the oldest slot. The value becomes index 0.
    #[inline]
    pub fn push(&mut self, value: T) {
        self.head = (self.head + 1) % N;
        self.buffer[self.head] = value;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        N
    }

    /// Value that was current `ticks_ago` pushes ago, or `None` if out of range
    #[inline]
    pub fn get(&self, ticks_ago: usize) -> Option<&T> {
        if ticks_ago < N {
            Some(&self.buffer[self.slot(ticks_ago)])
        } else {
            None
        }
    }

    #[inline]
    pub fn get_mut(&mut self, ticks_ago: usize) -> Option<&mut T> {
        if ticks_ago < N {
            let slot = self.slot(ticks_ago);
            Some(&mut self.buffer[slot])
        } else {
            None
        }
    }

    /// Iterate from newest (index 0) to oldest (index N - 1)
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..N).map(move |i| &self.buffer[self.slot(i)])
    }

    #[inline]
    fn slot(&self, ticks_ago: usize) -> usize {
        (self.head + N - ticks_ago) % N
    }
}

impl<T: Default, const N: usize> Default for CircularBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Index<usize> for CircularBuffer<T, N> {
    type Output = T;

    fn index(&self, ticks_ago: usize) -> &T {
        assert!(ticks_ago < N, "CircularBuffer index {} out of range (capacity {})", ticks_ago, N);
        &self.buffer[self.slot(ticks_ago)]
    }
}

impl<T, const N: usize> IndexMut<usize> for CircularBuffer<T, N> {
    fn index_mut(&mut self, ticks_ago: usize) -> &mut T {
        assert!(ticks_ago < N, "CircularBuffer index {} out of range (capacity {})", ticks_ago, N);
        let slot = self.slot(ticks_ago);
        &mut self.buffer[slot]
    }
}
