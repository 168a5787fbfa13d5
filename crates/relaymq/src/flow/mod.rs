// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Broker backpressure engine.
//!
//! The broker pauses delivery (connection-wide or per consumer) once its
//! outstanding-message budget for that scope is spent; the client must send
//! a resume grant before more messages flow. One [`FlowController`] per
//! connection tracks in-flight counts for every scope, recomputes resume
//! eligibility on each mutation, and hands eligible entries to a single
//! background dispatcher thread that performs the actual sends. The
//! dispatcher's idle timeout doubles as the connection keep-alive timer.

mod entry;

pub use entry::{FlowEntry, FlowKey};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::transport::{ConsumerId, TransportCell};

#[derive(Debug, Default)]
struct DispatchState {
    /// Entries currently eligible for a resume grant. Membership is a pure
    /// function of each entry's counters, recomputed on every mutation.
    ready: HashSet<FlowKey>,
    closed: bool,
}

/// Per-connection flow-control hub. Cheap to clone via `Arc`.
pub struct FlowController {
    connection_id: u64,
    transport: TransportCell,
    entries: DashMap<FlowKey, Arc<FlowEntry>>,
    dispatch: Mutex<DispatchState>,
    cond: Condvar,
    chunk_size: u32,
    water_mark: u32,
    watermark_checked: bool,
    prefetch_threshold_percent: u8,
    ping_interval: Duration,
    /// Set by the connection on any outbound traffic; the dispatcher clears
    /// it each idle cycle and pings only when it stayed clear.
    traffic_seen: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FlowController {
    pub fn new(connection_id: u64, transport: TransportCell, config: &ClientConfig) -> Arc<Self> {
        let ctl = Arc::new(Self {
            connection_id,
            transport,
            entries: DashMap::new(),
            dispatch: Mutex::new(DispatchState::default()),
            cond: Condvar::new(),
            chunk_size: config.flow_chunk_size,
            water_mark: config.flow_water_mark,
            watermark_checked: config.connection_flow_enabled,
            prefetch_threshold_percent: config.prefetch_threshold_percent,
            ping_interval: config.ping_interval,
            traffic_seen: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        });
        ctl.entries.insert(
            FlowKey::Connection,
            Arc::new(FlowEntry::connection(ctl.water_mark, ctl.watermark_checked)),
        );
        ctl
    }

    /// Spawn the dispatcher thread. Separate from construction so the
    /// eligibility machinery is observable without a live thread.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return;
        }
        let ctl = Arc::clone(self);
        let name = format!("relaymq-flow-dispatcher-{}", self.connection_id);
        match thread::Builder::new().name(name).spawn(move || ctl.run_dispatcher()) {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!("[flow] failed to spawn dispatcher thread: {e}"),
        }
    }

    /// Permanently stop the dispatcher and release its thread.
    pub fn close(&self) {
        {
            let mut st = self.dispatch.lock();
            st.closed = true;
        }
        self.cond.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("[flow] dispatcher thread panicked during shutdown");
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a consumer's prefetch meter. `prefetch_max` of 0 means
    /// unbounded.
    pub fn register_consumer(&self, id: ConsumerId, prefetch_max: u32) {
        let entry = Arc::new(FlowEntry::consumer(
            id,
            prefetch_max,
            self.prefetch_threshold_percent,
        ));
        self.entries.insert(FlowKey::Consumer(id), entry);
        trace!("[flow] registered consumer {id} prefetch_max={prefetch_max}");
    }

    pub fn deregister_consumer(&self, id: ConsumerId) {
        let key = FlowKey::Consumer(id);
        self.entries.remove(&key);
        let mut st = self.dispatch.lock();
        st.ready.remove(&key);
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    pub fn message_received(&self, key: FlowKey) {
        if let Some(entry) = self.entry(key) {
            entry.message_received();
            self.update_membership(&entry);
        }
    }

    /// Decrement the in-flight count and re-evaluate resume eligibility.
    pub fn message_delivered(&self, key: FlowKey) {
        if let Some(entry) = self.entry(key) {
            entry.message_delivered();
            self.update_membership(&entry);
        }
    }

    /// The broker signalled it is paused for this entity. A pause for an
    /// entity that was never registered is a protocol-state fault.
    pub fn request_resume(&self, key: FlowKey) {
        match self.entry(key) {
            Some(entry) => {
                entry.request_resume();
                self.update_membership(&entry);
            }
            None => error!("[flow] broker paused unregistered entity {key}"),
        }
    }

    /// Discarded `reduce_by` undelivered messages (session recover or
    /// failover); they no longer count against capacity. Always runs, even
    /// when watermark checking is disabled.
    pub fn reset_flow(&self, key: FlowKey, reduce_by: u32) {
        if let Some(entry) = self.entry(key) {
            entry.reset(reduce_by);
            self.update_membership(&entry);
        }
    }

    /// Zero an entity's in-flight count (session recover or failover wiped
    /// its buffered messages) and re-evaluate resume eligibility.
    pub fn clear_flow(&self, key: FlowKey) {
        if let Some(entry) = self.entry(key) {
            entry.clear_in_queue();
            self.update_membership(&entry);
        }
    }

    /// Note outbound traffic so the dispatcher skips its next keep-alive.
    pub fn note_traffic(&self) {
        self.traffic_seen.store(true, Ordering::Relaxed);
    }

    fn entry(&self, key: FlowKey) -> Option<Arc<FlowEntry>> {
        self.entries.get(&key).map(|e| Arc::clone(&e))
    }

    // Lock order: entry counters first, dispatch second. Never the reverse.
    fn update_membership(&self, entry: &FlowEntry) {
        let ready = entry.is_ready();
        let mut st = self.dispatch.lock();
        if st.closed {
            return;
        }
        let changed = if ready {
            st.ready.insert(entry.key)
        } else {
            st.ready.remove(&entry.key)
        };
        drop(st);
        if changed && ready {
            self.cond.notify_all();
        }
    }

    /// Snapshot of the ready set, for diagnostics and tests.
    pub fn ready_keys(&self) -> Vec<FlowKey> {
        self.dispatch.lock().ready.iter().copied().collect()
    }

    // ========================================================================
    // Dispatcher
    // ========================================================================

    fn run_dispatcher(self: Arc<Self>) {
        debug!("[flow] dispatcher started for connection {}", self.connection_id);
        loop {
            let batch: Vec<FlowKey> = {
                let mut st = self.dispatch.lock();
                while st.ready.is_empty() && !st.closed {
                    let timed_out = self
                        .cond
                        .wait_for(&mut st, self.ping_interval)
                        .timed_out();
                    if timed_out && st.ready.is_empty() && !st.closed {
                        drop(st);
                        self.idle_ping();
                        st = self.dispatch.lock();
                    }
                }
                if st.closed {
                    break;
                }
                let keys: Vec<FlowKey> = st.ready.drain().collect();
                keys
            };

            for key in batch {
                if !self.send_resume(key) {
                    debug!("[flow] dispatcher exiting, connection closed");
                    return;
                }
            }
        }
        debug!("[flow] dispatcher stopped for connection {}", self.connection_id);
    }

    /// Send one resume grant. Returns false only when the connection is
    /// closed and the dispatcher must exit.
    fn send_resume(&self, key: FlowKey) -> bool {
        let Some(entry) = self.entry(key) else {
            return true; // deregistered while queued
        };
        // Re-check under the entry lock: delivery may have outrun the
        // ready-set snapshot.
        let Some(grant) = entry.take_grant() else {
            return true;
        };
        let transport = self.transport.get();
        let result = match key {
            FlowKey::Connection => transport.resume_connection_flow(self.chunk_size),
            FlowKey::Consumer(id) => transport.resume_consumer_flow(id, grant),
        };
        match result {
            Ok(()) => {
                self.note_traffic();
                trace!("[flow] resume sent for {key} grant={grant}");
                true
            }
            Err(Error::Closed) => false,
            Err(e) => {
                // Recovery re-requests resume after rebuild, so the lost
                // grant is not fatal.
                warn!("[flow] resume send failed for {key}: {e}");
                true
            }
        }
    }

    fn idle_ping(&self) {
        if self.traffic_seen.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.transport.get().ping() {
            info!("[flow] keep-alive ping failed: {e}");
        } else {
            trace!("[flow] keep-alive ping sent");
        }
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("connection_id", &self.connection_id)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubTransport;

    fn controller() -> Arc<FlowController> {
        let cfg = ClientConfig {
            prefetch_max: 10,
            prefetch_threshold_percent: 50,
            ..ClientConfig::default()
        };
        FlowController::new(1, TransportCell::new(Arc::new(StubTransport::default())), &cfg)
    }

    #[test]
    fn membership_tracks_eligibility() {
        let ctl = controller();
        ctl.register_consumer(7, 10);
        let key = FlowKey::Consumer(7);

        for _ in 0..6 {
            ctl.message_received(key);
        }
        ctl.request_resume(key);
        assert!(ctl.ready_keys().is_empty(), "6 in flight, water mark 5");

        ctl.message_delivered(key);
        assert_eq!(ctl.ready_keys(), vec![key], "eligible at exactly 5");
    }

    #[test]
    fn reset_makes_entry_eligible() {
        let ctl = controller();
        ctl.register_consumer(3, 10);
        let key = FlowKey::Consumer(3);
        for _ in 0..10 {
            ctl.message_received(key);
        }
        ctl.request_resume(key);
        assert!(ctl.ready_keys().is_empty());

        ctl.reset_flow(key, 10);
        assert_eq!(ctl.ready_keys(), vec![key]);
    }

    #[test]
    fn receipt_over_the_mark_leaves_the_ready_set() {
        let ctl = controller();
        ctl.register_consumer(6, 10);
        let key = FlowKey::Consumer(6);
        ctl.request_resume(key);
        assert_eq!(ctl.ready_keys(), vec![key]);

        for _ in 0..6 {
            ctl.message_received(key);
        }
        assert!(ctl.ready_keys().is_empty(), "receipt past the mark revokes eligibility");
    }

    #[test]
    fn clear_zeroes_the_in_flight_count() {
        let ctl = controller();
        ctl.register_consumer(4, 10);
        let key = FlowKey::Consumer(4);
        for _ in 0..7 {
            ctl.message_received(key);
        }
        ctl.request_resume(key);
        assert!(ctl.ready_keys().is_empty());

        ctl.clear_flow(key);
        assert_eq!(ctl.ready_keys(), vec![key]);
    }

    #[test]
    fn deregister_purges_ready_membership() {
        let ctl = controller();
        ctl.register_consumer(5, 10);
        let key = FlowKey::Consumer(5);
        ctl.request_resume(key);
        assert_eq!(ctl.ready_keys(), vec![key]);

        ctl.deregister_consumer(5);
        assert!(ctl.ready_keys().is_empty());
        // Further accounting on the gone key is a no-op.
        ctl.message_delivered(key);
        ctl.request_resume(key);
        assert!(ctl.ready_keys().is_empty());
    }
}
