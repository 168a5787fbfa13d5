// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Priority-ordered, monitor-guarded delivery buffer.
//!
//! One queue per session (and per connection-consumer). Reader threads park
//! in [`DeliveryQueue::dequeue_wait`]; the read channel wakes them on
//! enqueue. `lock`/`unlock` suspend and resume delivery without losing
//! buffered content (connection stop/start); `close` is terminal and
//! releases every current and future waiter with no result.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::unit::{DeliveryUnit, PRIORITY_LEVELS};

#[derive(Debug, Default)]
struct Buckets {
    slots: [VecDeque<DeliveryUnit>; PRIORITY_LEVELS],
    len: usize,
}

impl Buckets {
    fn push_back(&mut self, unit: DeliveryUnit) {
        self.slots[unit.priority as usize].push_back(unit);
        self.len += 1;
    }

    fn push_front(&mut self, unit: DeliveryUnit) {
        self.slots[unit.priority as usize].push_front(unit);
        self.len += 1;
    }

    // Oldest unit of the highest non-empty priority bucket.
    fn pop(&mut self) -> Option<DeliveryUnit> {
        for slot in self.slots.iter_mut().rev() {
            if let Some(unit) = slot.pop_front() {
                self.len -= 1;
                return Some(unit);
            }
        }
        None
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.len = 0;
    }
}

#[derive(Debug, Default)]
struct State {
    buckets: Buckets,
    /// Delivery suspended (connection stopped). Buffered units are kept.
    is_locked: bool,
    /// Set by a parked reader while locked, so the stopping thread can
    /// confirm the reader is quiescent before returning.
    reader_parked: bool,
    /// Terminal.
    is_closed: bool,
    /// Wake sentinel: a listener was registered after units arrived; the
    /// reader must wake with no result and perform late delivery.
    listener_set_late: bool,
}

/// A synchronized queue allowing one thread to block on a dequeue and be
/// notified when another thread enqueues.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    state: Mutex<State>,
    cond: Condvar,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert by priority and wake waiters.
    pub fn enqueue(&self, unit: DeliveryUnit) {
        let mut st = self.state.lock();
        if st.is_closed {
            return;
        }
        st.buckets.push_back(unit);
        drop(st);
        self.cond.notify_all();
    }

    /// Insert ahead of same-priority peers (re-delivery, wake sentinels).
    pub fn enqueue_front(&self, unit: DeliveryUnit) {
        let mut st = self.state.lock();
        if st.is_closed {
            return;
        }
        st.buckets.push_front(unit);
        drop(st);
        self.cond.notify_all();
    }

    /// Block until a unit is available, the queue closes (no result), or
    /// `timeout` elapses with the queue empty and unlocked (no result).
    /// A zero timeout blocks indefinitely.
    ///
    /// While the queue is locked, the waiter parks regardless of content
    /// and advertises that it has parked (see [`DeliveryQueue::stop`]).
    pub fn dequeue_wait(&self, timeout: Duration) -> Option<DeliveryUnit> {
        let mut st = self.state.lock();
        loop {
            if st.is_closed {
                return None;
            }
            if st.listener_set_late {
                // Reader resets the flag after performing late delivery.
                return None;
            }
            if !st.is_locked {
                if let Some(unit) = st.buckets.pop() {
                    return Some(unit);
                }
            } else if !st.reader_parked {
                st.reader_parked = true;
                self.cond.notify_all();
            }

            if timeout.is_zero() {
                self.cond.wait(&mut st);
            } else {
                let timed_out = self.cond.wait_for(&mut st, timeout).timed_out();
                if timed_out && st.buckets.len == 0 && !st.is_locked {
                    return None;
                }
            }
        }
    }

    /// Suspend delivery, keeping buffered content. With `do_wait`, blocks
    /// until the reader confirms it has parked (or the queue closes).
    pub fn stop(&self, do_wait: bool) {
        let mut st = self.state.lock();
        st.is_locked = true;
        if do_wait {
            self.cond.notify_all();
            while !st.is_closed && st.is_locked && !st.reader_parked {
                self.cond.wait(&mut st);
            }
        } else {
            st.reader_parked = true;
            drop(st);
            self.cond.notify_all();
        }
    }

    /// Resume delivery after [`DeliveryQueue::stop`].
    pub fn start(&self) {
        let mut st = self.state.lock();
        st.is_locked = false;
        st.reader_parked = false;
        drop(st);
        self.cond.notify_all();
    }

    /// Discard all buffered units (after failover they reference a stale
    /// transport session). Returns how many were dropped so the caller can
    /// return their capacity to flow control.
    pub fn clear(&self) -> usize {
        let mut st = self.state.lock();
        let discarded = st.buckets.len;
        st.buckets.clear();
        discarded
    }

    /// Terminal and idempotent: unblocks every current and future waiter
    /// with no result.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.is_closed = true;
        st.is_locked = false;
        drop(st);
        self.cond.notify_all();
    }

    /// Wake a parked reader with no result so it performs late-listener
    /// delivery. The reader clears the flag via `clear_listener_late`.
    pub fn set_listener_late_notify(&self) {
        let mut st = self.state.lock();
        st.listener_set_late = true;
        drop(st);
        self.cond.notify_all();
    }

    /// Consume the late-listener sentinel. Returns whether it was set.
    pub fn clear_listener_late(&self) -> bool {
        let mut st = self.state.lock();
        std::mem::take(&mut st.listener_set_late)
    }

    pub fn len(&self) -> usize {
        self.state.lock().buckets.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().is_locked
    }
}
