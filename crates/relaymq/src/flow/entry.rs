// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Per-entity flow accounting.

use parking_lot::Mutex;

use crate::transport::ConsumerId;

/// Identity of a flow-controlled entity within one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKey {
    /// The connection-wide meter.
    Connection,
    /// One consumer's prefetch meter.
    Consumer(ConsumerId),
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowKey::Connection => write!(f, "connection"),
            FlowKey::Consumer(id) => write!(f, "consumer-{id}"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    /// Messages received but not yet delivered to the application.
    in_queue: u32,
    /// The broker has paused this entity and wants a resume signal.
    resume_requested: bool,
}

/// Watermark tracker for one flow-controlled entity.
///
/// Capacity semantics differ by scope. A consumer entry carries the
/// prefetch ceiling (`max_capacity`, 0 = unbounded) and a derived water
/// mark; its resume grant refills up to the ceiling. A connection entry has
/// no ceiling of its own; its water mark is the connection watermark (or
/// disabled entirely) and its grant is a fixed chunk chosen by the
/// dispatcher.
#[derive(Debug)]
pub struct FlowEntry {
    pub key: FlowKey,
    /// Prefetch ceiling for consumer entries; 0 means unbounded.
    max_capacity: u32,
    /// In-queue count at/below which resume becomes eligible.
    water_mark: u32,
    /// When false, eligibility ignores the water mark (resume as soon as
    /// requested). Connection scope only.
    watermark_checked: bool,
    counters: Mutex<Counters>,
}

impl FlowEntry {
    pub fn connection(water_mark: u32, watermark_checked: bool) -> Self {
        Self {
            key: FlowKey::Connection,
            max_capacity: 0,
            water_mark,
            watermark_checked,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn consumer(id: ConsumerId, max_capacity: u32, threshold_percent: u8) -> Self {
        let water_mark = (u64::from(max_capacity) * u64::from(threshold_percent) / 100) as u32;
        Self {
            key: FlowKey::Consumer(id),
            max_capacity,
            water_mark,
            watermark_checked: true,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn message_received(&self) {
        self.counters.lock().in_queue += 1;
    }

    pub fn message_delivered(&self) {
        let mut c = self.counters.lock();
        c.in_queue = c.in_queue.saturating_sub(1);
    }

    pub fn request_resume(&self) {
        self.counters.lock().resume_requested = true;
    }

    /// Subtract `reduce_by` from the in-queue count, flooring at zero.
    /// Runs after session recover/redelivery discards buffered messages.
    pub fn reset(&self, reduce_by: u32) {
        let mut c = self.counters.lock();
        c.in_queue = c.in_queue.saturating_sub(reduce_by);
    }

    /// Zero the in-queue count outright. Session recover and failover wipe
    /// every buffered message for the entity; the window reopens in full.
    pub fn clear_in_queue(&self) {
        self.counters.lock().in_queue = 0;
    }

    /// Ready to resume: requested, and either capacity is unbounded with no
    /// watermark check, or the in-queue count is at/below the water mark.
    pub fn is_ready(&self) -> bool {
        let c = self.counters.lock();
        if !c.resume_requested {
            return false;
        }
        if !self.watermark_checked {
            return true;
        }
        if self.max_capacity == 0 && self.key != FlowKey::Connection {
            return true;
        }
        c.in_queue <= self.water_mark
    }

    /// Atomically consume readiness: if eligible, clear `resume_requested`
    /// and return the grant to send. Consumer grant refills the prefetch
    /// window (`max_capacity - in_queue`, 0 = unlimited for an unbounded
    /// entry); connection grant is decided by the caller.
    pub fn take_grant(&self) -> Option<u32> {
        let mut c = self.counters.lock();
        if !c.resume_requested {
            return None;
        }
        let eligible = if !self.watermark_checked {
            true
        } else if self.max_capacity == 0 && self.key != FlowKey::Connection {
            true
        } else {
            c.in_queue <= self.water_mark
        };
        if !eligible {
            return None;
        }
        let grant = self.max_capacity.saturating_sub(c.in_queue);
        // A bounded entry with no room must not send: a 0 grant means
        // "unlimited" on the wire. The request stays pending until a
        // delivery frees capacity and re-evaluates membership.
        if self.max_capacity > 0 && grant == 0 {
            return None;
        }
        c.resume_requested = false;
        Some(grant)
    }

    pub fn in_queue(&self) -> u32 {
        self.counters.lock().in_queue
    }

    pub fn resume_requested(&self) -> bool {
        self.counters.lock().resume_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_ready_exactly_at_water_mark() {
        let e = FlowEntry::consumer(7, 10, 50);
        e.request_resume();
        for _ in 0..6 {
            e.message_received();
        }
        assert!(!e.is_ready(), "6 in queue, water mark 5");
        e.message_delivered();
        assert!(e.is_ready(), "ready exactly at the transition to 5");
    }

    #[test]
    fn grant_refills_prefetch_window() {
        let e = FlowEntry::consumer(3, 10, 50);
        e.request_resume();
        for _ in 0..4 {
            e.message_received();
        }
        assert_eq!(e.take_grant(), Some(6));
        assert!(!e.resume_requested(), "grant consumes the request");
        assert_eq!(e.take_grant(), None);
    }

    #[test]
    fn reset_floors_at_zero() {
        let e = FlowEntry::consumer(1, 10, 50);
        e.message_received();
        e.message_received();
        e.reset(100);
        assert_eq!(e.in_queue(), 0);
    }

    #[test]
    fn unbounded_consumer_is_always_ready_when_requested() {
        let e = FlowEntry::consumer(9, 0, 50);
        assert!(!e.is_ready());
        e.request_resume();
        for _ in 0..1000 {
            e.message_received();
        }
        assert!(e.is_ready());
        assert_eq!(e.take_grant(), Some(0), "0 grant means unlimited");
    }

    #[test]
    fn connection_entry_honors_watermark_toggle() {
        let checked = FlowEntry::connection(2, true);
        checked.request_resume();
        for _ in 0..3 {
            checked.message_received();
        }
        assert!(!checked.is_ready());

        let unchecked = FlowEntry::connection(2, false);
        unchecked.request_resume();
        for _ in 0..3 {
            unchecked.message_received();
        }
        assert!(unchecked.is_ready());
    }
}
