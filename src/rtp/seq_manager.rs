use std::collections::BTreeSet;

#[cfg(test)]
mod seq_manager_test;

/// Number type living in a wrapping sequence space (`u16` for RTP sequence
/// numbers, `u32` for RTP timestamps).
pub trait SeqNum: Copy + Eq + Ord {
    const ZERO: Self;
    const ONE: Self;
    /// Half the sequence space, the cut-off for "is newer" comparisons.
    const HALF: Self;

    fn wrapping_add(self, other: Self) -> Self;
    fn wrapping_sub(self, other: Self) -> Self;
    fn from_count(count: usize) -> Self;

    /// `self` is strictly newer than `other` in wrapping order.
    fn is_newer_than(self, other: Self) -> bool {
        self != other && self.wrapping_sub(other) < Self::HALF
    }
}

impl SeqNum for u16 {
    const ZERO: Self = 0;
    const ONE: Self = 1;
    const HALF: Self = 1 << 15;

    fn wrapping_add(self, other: Self) -> Self {
        u16::wrapping_add(self, other)
    }
    fn wrapping_sub(self, other: Self) -> Self {
        u16::wrapping_sub(self, other)
    }
    fn from_count(count: usize) -> Self {
        count as u16
    }
}

impl SeqNum for u32 {
    const ZERO: Self = 0;
    const ONE: Self = 1;
    const HALF: Self = 1 << 31;

    fn wrapping_add(self, other: Self) -> Self {
        u32::wrapping_add(self, other)
    }
    fn wrapping_sub(self, other: Self) -> Self {
        u32::wrapping_sub(self, other)
    }
    fn from_count(count: usize) -> Self {
        count as u32
    }
}

/// Remaps an input sequence-number (or timestamp) space onto a contiguous
/// output space.
///
/// Until the first [`sync`](SeqManager::sync) the mapping is the identity.
/// After a sync the output continues right after the highest value emitted so
/// far, hiding the discontinuity of the input (producer resync, layer
/// switch, pause/resume). [`drop_input`](SeqManager::drop_input) records
/// inputs that were consumed but never emitted, so later outputs close the
/// gap they would otherwise leave.
#[derive(Debug)]
pub struct SeqManager<T: SeqNum> {
    /// `output = input - base - dropped_before(input)`.
    base: T,
    /// Continuation step applied by `sync`: one for sequence numbers, zero
    /// for timestamps (those continue via `offset` instead).
    sync_step: T,
    max_input: T,
    max_output: T,
    started: bool,
    dropped: BTreeSet<T>,
}

impl<T: SeqNum> SeqManager<T> {
    pub fn for_seqs() -> Self {
        Self::new(T::ONE)
    }

    pub fn for_timestamps() -> Self {
        Self::new(T::ZERO)
    }

    fn new(sync_step: T) -> Self {
        Self {
            base: T::ZERO,
            sync_step,
            max_input: T::ZERO,
            max_output: T::ZERO,
            started: false,
            dropped: BTreeSet::new(),
        }
    }

    /// Map an input value to its output value.
    pub fn input(&mut self, input: T) -> T {
        let dropped_before = self
            .dropped
            .iter()
            .filter(|&&d| d != input && input.wrapping_sub(d) < T::HALF)
            .count();

        let output = input
            .wrapping_sub(self.base)
            .wrapping_sub(T::from_count(dropped_before));

        if !self.started {
            self.started = true;
            self.max_input = input;
            self.max_output = output;
        } else {
            if input.is_newer_than(self.max_input) {
                self.max_input = input;
            }
            if output.is_newer_than(self.max_output) {
                self.max_output = output;
            }
        }

        self.purge_dropped();

        output
    }

    /// Re-anchor the mapping at `input` so that output continues from the
    /// highest value emitted so far.
    pub fn sync(&mut self, input: T) {
        self.base = input.wrapping_sub(self.max_output.wrapping_add(self.sync_step));
        self.max_input = input;
        self.dropped.clear();

        if !self.started {
            self.started = true;
        }
    }

    /// Record `input` as consumed-but-not-emitted.
    pub fn drop_input(&mut self, input: T) {
        if !self.started || input.is_newer_than(self.max_input) {
            self.dropped.insert(input);
        }
    }

    /// Shift all future outputs forward by `delta`.
    pub fn offset(&mut self, delta: T) {
        self.base = self.base.wrapping_sub(delta);
    }

    pub fn max_output(&self) -> T {
        self.max_output
    }

    /// Dropped entries further than half the space behind the newest input
    /// can no longer affect any `input` call.
    fn purge_dropped(&mut self) {
        let max_input = self.max_input;
        self.dropped
            .retain(|&d| max_input.wrapping_sub(d) < T::HALF);
    }
}
