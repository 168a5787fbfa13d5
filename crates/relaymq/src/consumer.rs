// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Consumer-side delivery endpoints.
//!
//! A [`ConsumerHandle`] binds a broker consumer id to an application
//! callback. A [`ConnectionConsumer`] is the connection-scoped variant
//! (server sessions, load-balanced delivery): it owns a private queue and
//! reader instead of sharing its session's, and carries the failing-over
//! mark recovery uses to quiesce it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::delivery::DeliveryQueue;
use crate::reader::{ReaderEvents, SessionReader};
use crate::transport::{ConsumerId, ConsumerSpec, InboundMessage};

/// Application message callback. Errors it returns are application
/// failures: logged, never fatal to the reader.
pub type MessageCallback = Box<dyn Fn(InboundMessage) -> crate::error::Result<()> + Send + Sync>;

pub struct ConsumerHandle {
    id: ConsumerId,
    spec: ConsumerSpec,
    prefetch_max: u32,
    callback: MessageCallback,
    closed: AtomicBool,
}

impl ConsumerHandle {
    pub fn new(id: ConsumerId, spec: ConsumerSpec, prefetch_max: u32, callback: MessageCallback) -> Self {
        Self {
            id,
            spec,
            prefetch_max,
            callback,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn prefetch_max(&self) -> u32 {
        self.prefetch_max
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Run the application callback. Application errors are absorbed here;
    /// the reader must keep running.
    pub fn deliver(&self, message: InboundMessage) {
        if self.is_closed() {
            warn!("[consumer] dropping message for closed consumer {}", self.id);
            return;
        }
        if let Err(e) = (self.callback)(message) {
            warn!("[consumer] callback for consumer {} failed: {e}", self.id);
        }
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("id", &self.id)
            .field("destination", &self.spec.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connection-scoped consumer with a private queue and reader.
pub struct ConnectionConsumer {
    handle: Arc<ConsumerHandle>,
    queue: Arc<DeliveryQueue>,
    reader: SessionReader,
    /// Recovery sets this while rebuilding; routing skips the consumer and
    /// its queue content is invalid.
    failover_in_progress: AtomicBool,
}

impl ConnectionConsumer {
    pub fn new(
        handle: Arc<ConsumerHandle>,
        events: Arc<dyn ReaderEvents>,
        idle_interval: Duration,
    ) -> Self {
        let queue = Arc::new(DeliveryQueue::new());
        let reader = SessionReader::new(handle.id(), Arc::clone(&queue), events, idle_interval);
        Self {
            handle,
            queue,
            reader,
            failover_in_progress: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &Arc<ConsumerHandle> {
        &self.handle
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn start(&self) {
        self.reader.start();
    }

    pub fn stop(&self, do_wait: bool) {
        self.reader.stop(do_wait);
    }

    pub fn close(&self) {
        self.handle.close();
        self.reader.close();
    }

    pub fn is_failing_over(&self) -> bool {
        self.failover_in_progress.load(Ordering::SeqCst)
    }

    /// Enter failover: future routing skips this consumer and buffered
    /// units are discarded.
    pub fn begin_failover(&self) {
        self.failover_in_progress.store(true, Ordering::SeqCst);
        self.queue.clear();
    }

    pub fn end_failover(&self) {
        self.failover_in_progress.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ConnectionConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConsumer")
            .field("id", &self.handle.id())
            .field("failover_in_progress", &self.is_failing_over())
            .finish()
    }
}
