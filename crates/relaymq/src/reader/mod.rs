// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Dispatch workers.
//!
//! Two loops move inbound traffic. The connection's [`ReadChannel`] pulls
//! units off the transport and routes them (session queue, reply waiter, or
//! control handler). Each session's [`SessionReader`] blocks on its
//! [`DeliveryQueue`](crate::delivery::DeliveryQueue) and drives consumer
//! callbacks, clearing the queue instead of delivering when recovery has
//! invalidated its buffered content.

mod channel;

pub use channel::{InboundSink, ReadChannel};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::delivery::{DeliveryQueue, DeliveryUnit};
use crate::error::{Error, Result};

/// Session-side services a reader worker needs each iteration.
pub trait ReaderEvents: Send + Sync {
    /// The owning transport has failed; buffered units are undeliverable.
    fn is_transport_broken(&self) -> bool;
    /// Recovery is rebuilding the connection.
    fn is_recovering(&self) -> bool;
    /// Deliver one unit to its consumer callback. Application-thrown
    /// errors must be absorbed and logged by the implementation; an `Err`
    /// from here means a fault in system code and stops the reader.
    fn dispatch(&self, unit: DeliveryUnit) -> Result<()>;
    /// Periodic work between messages: delayed-acknowledgment flushes,
    /// late-listener delivery.
    fn idle_housekeeping(&self);
    /// The reader hit a fatal system fault and is exiting.
    fn on_fatal(&self, err: &Error);
}

/// One dispatch worker per session (and per connection-consumer).
///
/// Start, stop and close are idempotent. A stop followed by a start reuses
/// the parked worker when it is still alive; a new worker gets a fresh
/// generation number in its thread name for diagnostics.
pub struct SessionReader {
    session_id: u64,
    queue: Arc<DeliveryQueue>,
    events: Arc<dyn ReaderEvents>,
    idle_interval: Duration,
    generation: AtomicU64,
    stop_requested: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionReader {
    pub fn new(
        session_id: u64,
        queue: Arc<DeliveryQueue>,
        events: Arc<dyn ReaderEvents>,
        idle_interval: Duration,
    ) -> Self {
        Self {
            session_id,
            queue,
            events,
            idle_interval,
            generation: AtomicU64::new(0),
            stop_requested: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Ensure a worker is running and delivery is unlocked.
    pub fn start(&self) {
        let mut slot = self.worker.lock();
        let alive = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if alive {
            // Same worker, just resume delivery.
            self.queue.start();
            return;
        }
        if self.queue.is_closed() {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.queue.start();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("relaymq-session-reader-{}-g{gen}", self.session_id);
        let queue = Arc::clone(&self.queue);
        let events = Arc::clone(&self.events);
        let stop = Arc::clone(&self.stop_requested);
        let idle = self.idle_interval;
        let session_id = self.session_id;
        match thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(session_id, queue, events, stop, idle))
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!("[reader] failed to spawn session {session_id} reader: {e}"),
        }
    }

    /// Suspend delivery without losing buffered units. With `do_wait`,
    /// returns only once a live worker has parked; when no worker is
    /// running there is nobody to park and the wait is skipped.
    pub fn stop(&self, do_wait: bool) {
        self.queue.stop(do_wait && self.is_running());
    }

    /// Terminal: close the queue, release the worker, join it.
    pub fn close(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.queue.close();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("[reader] session {} reader panicked during close", self.session_id);
            }
        }
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

fn run_loop(
    session_id: u64,
    queue: Arc<DeliveryQueue>,
    events: Arc<dyn ReaderEvents>,
    stop: Arc<AtomicBool>,
    idle_interval: Duration,
) {
    debug!("[reader] session {session_id} reader running");
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match queue.dequeue_wait(idle_interval) {
            Some(unit) => {
                if events.is_transport_broken() {
                    debug!("[reader] session {session_id} transport broken, exiting");
                    break;
                }
                if events.is_recovering() {
                    // This unit and anything still buffered reference the
                    // dead transport.
                    drop(unit);
                    queue.clear();
                    continue;
                }
                if let Err(e) = events.dispatch(unit) {
                    error!("[reader] session {session_id} fatal dispatch fault: {e}");
                    events.on_fatal(&e);
                    break;
                }
            }
            None => {
                if queue.is_closed() {
                    break;
                }
                if events.is_recovering() {
                    // Buffered units reference the dead transport.
                    queue.clear();
                    continue;
                }
                events.idle_housekeeping();
            }
        }
    }
    // The loop never exits without closing its queue.
    queue.close();
    debug!("[reader] session {session_id} reader stopped");
}

impl std::fmt::Debug for SessionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReader")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}
