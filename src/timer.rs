//! A min-heap of one-shot and periodic timers, per `spec.md` §4.C.
//!
//! The "callback" the source describes is represented here as a
//! cloneable payload `T` that the owner (the dispatcher/facade)
//! pattern-matches on when a timer fires, rather than a boxed closure —
//! simpler to reason about in a single-threaded cooperative loop and
//! avoids `dyn FnMut` lifetime bookkeeping for no benefit here.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// A timer definition handed to [`TimerQueue::start`].
pub struct TimerSpec<T> {
    pub period: Duration,
    pub payload: T,
    pub oneshot: bool,
}

struct HeapEntry<T> {
    next_fire: Instant,
    seq: u64,
    period: Duration,
    payload: T,
    oneshot: bool,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.next_fire == other.next_fire && self.seq == other.seq
    }
}
impl<T> Eq for HeapEntry<T> {}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest next_fire
        // (and, on a tie, the earliest inserted) is popped first.
        other
            .next_fire
            .cmp(&self.next_fire)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerQueue<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    next_seq: u64,
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Starts a timer: `next_fire = now + period`.
    pub fn start(&mut self, spec: TimerSpec<T>) {
        self.start_at(spec, Instant::now());
    }

    pub fn start_at(&mut self, spec: TimerSpec<T>, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            next_fire: now + spec.period,
            seq,
            period: spec.period,
            payload: spec.payload,
            oneshot: spec.oneshot,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.next_fire)
    }

    /// Pops and returns every timer whose `next_fire <= now`, re-arming
    /// periodic ones at `next_fire += period` (not `now + period`, so
    /// periodic timers don't drift under scheduling jitter). One-shot
    /// timers are consumed and not re-armed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.next_fire > now {
                break;
            }
            let mut entry = self.heap.pop().unwrap();
            fired.push(entry.payload.clone());
            if !entry.oneshot {
                entry.next_fire += entry.period;
                self.heap.push(entry);
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T: Clone> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut q: TimerQueue<&'static str> = TimerQueue::new();
        let base = Instant::now();
        q.start_at(
            TimerSpec {
                period: Duration::from_secs(10),
                payload: "late",
                oneshot: true,
            },
            base,
        );
        q.start_at(
            TimerSpec {
                period: Duration::from_secs(1),
                payload: "early",
                oneshot: true,
            },
            base,
        );
        let fired = q.drain_due(base + Duration::from_secs(5));
        assert_eq!(fired, vec!["early"]);
    }

    #[test]
    fn periodic_timer_does_not_drift() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        let base = Instant::now();
        q.start_at(
            TimerSpec {
                period: Duration::from_secs(10),
                payload: 1,
                oneshot: false,
            },
            base,
        );
        // Fires late, at t=23s instead of t=10s.
        let fired = q.drain_due(base + Duration::from_secs(23));
        assert_eq!(fired, vec![1]);
        // Next deadline is 20s (10 + 10), not 33s (23 + 10): no drift.
        let next = q.next_deadline().unwrap();
        assert_eq!(next, base + Duration::from_secs(20));
    }

    #[test]
    fn oneshot_timer_does_not_refire() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        let base = Instant::now();
        q.start_at(
            TimerSpec {
                period: Duration::from_secs(1),
                payload: 7,
                oneshot: true,
            },
            base,
        );
        assert_eq!(q.drain_due(base + Duration::from_secs(5)), vec![7]);
        assert!(q.is_empty());
    }

    #[test]
    fn insertion_order_tie_break() {
        let mut q: TimerQueue<u32> = TimerQueue::new();
        let base = Instant::now();
        for i in 0..5 {
            q.start_at(
                TimerSpec {
                    period: Duration::from_secs(1),
                    payload: i,
                    oneshot: true,
                },
                base,
            );
        }
        let fired = q.drain_due(base + Duration::from_secs(1));
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }
}
