// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Timer min-heap.
//!
//! Ported from the original reactor's timer manager: a binary heap keyed on
//! (deadline, insertion order) so two timers armed for the same millisecond
//! still fire in the order they were added. Deadlines are wall-clock
//! milliseconds, not monotonic, because the reactor needs to detect a
//! backward system clock step and treat it specially (see
//! `Inner::collect_expired`).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use parking_lot::Mutex;

/// How far back the wall clock has to jump before we treat it as a clock
/// reset rather than routine NTP skew, in milliseconds.
const ROLLBACK_THRESHOLD_MS: i64 = 60 * 60 * 1000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

type Callback = Box<dyn FnMut() + Send>;

struct TimerState {
    deadline_ms: AtomicI64,
    // Bumped on every `reset()`. A `HeapEntry` captures the generation it
    // was pushed under; `collect_expired` discards a popped entry whose
    // generation has gone stale instead of firing it, so a reset timer's
    // old heap entry can never fire at its pre-reset deadline.
    generation: AtomicU64,
    period_ms: Option<i64>,
    cancelled: AtomicBool,
    callback: Mutex<Option<Callback>>,
    condition: Option<Weak<()>>,
}

/// A live registration. Dropping this does not cancel the timer — use
/// `cancel()` explicitly, mirroring the original API's explicit-lifetime
/// timers (they outlive the caller's handle by design).
#[derive(Clone)]
pub struct TimerHandle(Arc<TimerState>);

impl TimerHandle {
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        *self.0.callback.lock() = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }
}

struct HeapEntry {
    deadline_ms: i64,
    seq: u64,
    generation: u64,
    timer: Arc<TimerState>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    seq: u64,
    last_now_ms: i64,
}

pub struct TimerManager {
    inner: Mutex<Inner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                seq: 0,
                last_now_ms: now_ms(),
            }),
        }
    }

    fn insert(&self, deadline_ms: i64, period_ms: Option<i64>, condition: Option<Weak<()>>, cb: Callback) -> TimerHandle {
        let state = Arc::new(TimerState {
            deadline_ms: AtomicI64::new(deadline_ms),
            generation: AtomicU64::new(0),
            period_ms,
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(cb)),
            condition,
        });

        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        let front_before = inner.heap.peek().map(|e| e.deadline_ms);
        inner.heap.push(HeapEntry {
            deadline_ms,
            seq,
            generation: 0,
            timer: state.clone(),
        });
        let front_after = inner.heap.peek().map(|e| e.deadline_ms);
        drop(inner);

        if front_after != front_before {
            self.on_timer_inserted_at_front();
        }

        TimerHandle(state)
    }

    /// Arm a one-shot timer `delay_ms` from now.
    pub fn add<F>(&self, delay_ms: u64, cb: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(now_ms() + delay_ms as i64, None, None, Box::new(cb))
    }

    /// Arm a recurring timer that re-fires every `period_ms` until cancelled.
    pub fn add_recurring<F>(&self, period_ms: u64, cb: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(
            now_ms() + period_ms as i64,
            Some(period_ms as i64),
            None,
            Box::new(cb),
        )
    }

    /// Like `add`, but the timer is silently skipped if `condition` has no
    /// more strong referents by the time it fires — used to bind a timer's
    /// lifetime to an owner (e.g. a socket) without an explicit cancel.
    pub fn add_conditional<F>(&self, delay_ms: u64, condition: &Arc<()>, cb: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(
            now_ms() + delay_ms as i64,
            None,
            Some(Arc::downgrade(condition)),
            Box::new(cb),
        )
    }

    /// Reschedule `handle` to fire `delay_ms` from now, leaving its callback
    /// and recurrence in place.
    pub fn reset(&self, handle: &TimerHandle, delay_ms: u64) {
        if handle.is_cancelled() {
            return;
        }
        let new_deadline = now_ms() + delay_ms as i64;
        handle.0.deadline_ms.store(new_deadline, Ordering::SeqCst);
        let generation = handle.0.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        let front_before = inner.heap.peek().map(|e| e.deadline_ms);
        inner.heap.push(HeapEntry {
            deadline_ms: new_deadline,
            seq,
            generation,
            timer: handle.0.clone(),
        });
        let front_after = inner.heap.peek().map(|e| e.deadline_ms);
        drop(inner);

        if front_after != front_before {
            self.on_timer_inserted_at_front();
        }
    }

    /// Milliseconds until the next deadline, or `None` if no timers are
    /// pending. Used by the reactor as its `epoll_wait` timeout.
    pub fn next_timeout_ms(&self) -> Option<i64> {
        let inner = self.inner.lock();
        inner.heap.peek().map(|e| {
            let delta = e.deadline_ms - now_ms();
            delta.max(0)
        })
    }

    /// Pop and return every callback due to run right now, re-arming
    /// recurring timers as it goes. On detecting the wall clock has jumped
    /// backward by more than an hour, every live timer is collected exactly
    /// once (the rollback is assumed to mean the process was suspended or
    /// the clock was corrected, not that time is flowing backward forever).
    pub fn collect_expired(&self) -> Vec<Callback> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        let rollback = now < inner.last_now_ms - ROLLBACK_THRESHOLD_MS;
        if rollback {
            warn!(
                "wall clock rolled back from {} to {}; flushing all live timers as expired",
                inner.last_now_ms, now
            );
        }
        inner.last_now_ms = now;

        let mut due = Vec::new();
        let mut requeue = Vec::new();

        loop {
            let fires = match inner.heap.peek() {
                Some(e) => rollback || e.deadline_ms <= now,
                None => false,
            };
            if !fires {
                break;
            }
            let entry = inner.heap.pop().unwrap();
            if entry.generation != entry.timer.generation.load(Ordering::SeqCst) {
                // Superseded by a `reset()` that pushed a fresher entry;
                // this one is a stale leftover from the old deadline.
                continue;
            }
            if entry.timer.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(cond) = &entry.timer.condition {
                if cond.upgrade().is_none() {
                    continue;
                }
            }
            if let Some(cb) = entry.timer.callback.lock().take() {
                due.push(cb);
            }
            if let Some(period) = entry.timer.period_ms {
                let next_deadline = now + period;
                entry.timer.deadline_ms.store(next_deadline, Ordering::SeqCst);
                let generation = entry.generation;
                let seq = inner.seq;
                inner.seq += 1;
                requeue.push(HeapEntry {
                    deadline_ms: next_deadline,
                    seq,
                    generation,
                    timer: entry.timer.clone(),
                });
            }
        }

        for entry in requeue {
            inner.heap.push(entry);
        }

        due
    }

    /// Called whenever an insert or reset lands a new earliest deadline.
    /// The reactor overrides this to interrupt a blocked `epoll_wait`; the
    /// default is a no-op for standalone use (e.g. tests).
    fn on_timer_inserted_at_front(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        mgr.add(0, move || o1.lock().push(1));
        let o2 = order.clone();
        mgr.add(0, move || o2.lock().push(2));

        std::thread::sleep(std::time::Duration::from_millis(5));
        let due = mgr.collect_expired();
        for mut cb in due {
            cb();
        }
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = mgr.add(0, move || f.store(true, Ordering::SeqCst));
        handle.cancel();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let due = mgr.collect_expired();
        assert!(due.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn recurring_timer_rearms() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = mgr.add_recurring(1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(3));
            for mut cb in mgr.collect_expired() {
                cb();
            }
        }
        handle.cancel();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn reset_to_later_deadline_does_not_fire_at_old_deadline() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = mgr.add(0, move || f.store(true, Ordering::SeqCst));

        // Push the deadline well into the future before the original
        // (already-due) entry is ever collected.
        mgr.reset(&handle, 60_000);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let due = mgr.collect_expired();
        assert!(due.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn conditional_timer_skipped_once_owner_dropped() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let owner = Arc::new(());
        let f = fired.clone();
        mgr.add_conditional(0, &owner, move || f.store(true, Ordering::SeqCst));
        drop(owner);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let due = mgr.collect_expired();
        assert!(due.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }
}
