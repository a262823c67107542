use super::ScheduledCall;
use crate::SimTime;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap size below which cancelled calls are never swept out of the middle.
const MIN_COMPACT_LEN: usize = 64;

/// Entry stored in a [`TimerQueue`]: a scheduled call plus its position in
/// the timeline.
struct TimerEntry {
    at: SimTime,
    seq: u64,
    call: ScheduledCall,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior in BinaryHeap; equal times fire in
        // scheduling order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of scheduled calls ordered by target time.
///
/// Cancelled calls are discarded when they reach the front. Whenever the heap
/// doubles since the last sweep, a push also sweeps out every dead call, so
/// far-future calls that are cancelled early do not pile up.
pub(crate) struct TimerQueue {
    next_seq: u64,
    entries: BinaryHeap<TimerEntry>,
    compact_at: usize,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self {
            next_seq: 0,
            entries: BinaryHeap::new(),
            compact_at: MIN_COMPACT_LEN,
        }
    }
}

impl TimerQueue {
    pub(crate) fn push(&mut self, call: ScheduledCall) {
        if self.entries.len() >= self.compact_at {
            self.entries.retain(|entry| entry.call.is_live());
            self.compact_at = MIN_COMPACT_LEN.max(2 * self.entries.len());
        }
        self.next_seq += 1;
        self.entries.push(TimerEntry {
            at: call.at(),
            seq: self.next_seq,
            call,
        });
    }

    /// Target time of the earliest live call.
    pub(crate) fn next_time(&mut self) -> Option<SimTime> {
        self.discard_dead();
        self.entries.peek().map(|entry| entry.at)
    }

    /// Remove and return the earliest live call due at or before `limit`.
    pub(crate) fn pop_due(&mut self, limit: SimTime) -> Option<ScheduledCall> {
        self.discard_dead();
        if self.entries.peek()?.at <= limit {
            self.entries.pop().map(|entry| entry.call)
        } else {
            None
        }
    }

    /// Number of calls that may still fire. Walks the whole heap.
    pub(crate) fn live(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.call.is_live())
            .count()
    }

    fn discard_dead(&mut self) {
        while self
            .entries
            .peek()
            .is_some_and(|entry| !entry.call.is_live())
        {
            self.entries.pop();
        }
    }
}
