// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Session state and dispatch glue.
//!
//! One [`Session`] owns a delivery queue, a reader worker, its consumers
//! and producers, unacknowledged-message bookkeeping, and (when transacted)
//! a transaction coordinator. The session implements the reader's event
//! hooks: it decodes units, routes them to consumer callbacks, flushes
//! delayed acknowledgments on idle, and cooperates with recovery through
//! the failover flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::consumer::{ConsumerHandle, MessageCallback};
use crate::delivery::{DeliveryQueue, DeliveryUnit, UnitKind};
use crate::error::{Error, Result};
use crate::flow::{FlowController, FlowKey};
use crate::reader::{ReaderEvents, SessionReader};
use crate::recovery::RecoveryCoordinator;
use crate::transport::{
    Codec, ConsumerId, ConsumerSpec, ProducerSpec, Request, RequestKind, TransportCell,
};
use crate::txn::{TransactionCoordinator, TxnContext, XaRegistry};

/// Delayed acknowledgments are flushed once this many accumulate (or on
/// reader idle, whichever comes first).
const ACK_BATCH: usize = 32;

/// Message ids consumed but not yet settled with the broker. Cleared by
/// commit/rollback/ack; discarded wholesale on failover.
#[derive(Debug, Default)]
pub struct UnackedStore {
    ids: Mutex<Vec<u64>>,
}

impl UnackedStore {
    pub fn record(&self, message_id: u64) {
        self.ids.lock().push(message_id);
    }

    pub fn clear(&self) {
        self.ids.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// Connection services a session depends on.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: TransportCell,
    pub flow: Arc<FlowController>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub signals: Arc<crate::connection::ConnectionSignals>,
    pub codec: Arc<dyn Codec>,
    pub xa_registry: Arc<XaRegistry>,
    pub config: ClientConfig,
}

struct SessionInner {
    id: u64,
    ctx: SessionContext,
    queue: Arc<DeliveryQueue>,
    consumers: DashMap<ConsumerId, Arc<ConsumerHandle>>,
    producers: DashMap<u64, ProducerSpec>,
    unacked: Arc<UnackedStore>,
    pending_acks: Mutex<Vec<u64>>,
    failover_occurred: Arc<AtomicBool>,
    has_listener: AtomicBool,
}

impl SessionInner {
    fn flush_acks(&self) {
        let batch: Vec<u64> = {
            let mut pending = self.pending_acks.lock();
            if pending.is_empty() {
                return;
            }
            pending.drain(..).collect()
        };
        let mut body = Vec::with_capacity(batch.len() * 8);
        for id in &batch {
            body.extend_from_slice(&id.to_le_bytes());
        }
        let request = Request::new(RequestKind::Acknowledge, body);
        match self.ctx.transport.get().send(&request) {
            Ok(()) => {
                self.ctx.flow.note_traffic();
                trace!("[session] session {} flushed {} acks", self.id, batch.len());
            }
            Err(e) => {
                // Recovery redelivers; the broker treats unacked messages
                // as outstanding either way.
                warn!("[session] session {} ack flush failed: {e}", self.id);
            }
        }
    }
}

impl ReaderEvents for SessionInner {
    // Unrecoverable conditions only; a transient link failure is handled
    // through the recovery path, not by killing the reader.
    fn is_transport_broken(&self) -> bool {
        self.ctx.signals.is_fatal() || self.ctx.recovery.is_aborted()
    }

    fn is_recovering(&self) -> bool {
        self.ctx.recovery.is_recovering()
    }

    fn dispatch(&self, unit: DeliveryUnit) -> Result<()> {
        match unit.kind {
            UnitKind::Message => {
                let consumer_id = unit.consumer_id;
                // A decode failure is a fault in system code, not in the
                // application callback.
                let message = self.ctx.codec.decode(&unit)?;
                match self.consumers.get(&consumer_id) {
                    Some(handle) => {
                        self.unacked.record(message.message_id);
                        handle.deliver(message);
                    }
                    None => {
                        // Benign race with a concurrent consumer close.
                        debug!(
                            "[session] session {} has no consumer {consumer_id}, dropping message",
                            self.id
                        );
                    }
                }
                self.ctx.flow.message_delivered(FlowKey::Consumer(consumer_id));
                self.ctx.flow.message_delivered(FlowKey::Connection);
                Ok(())
            }
            UnitKind::Reply | UnitKind::Control => {
                warn!("[session] session {} received non-message unit, ignoring", self.id);
                Ok(())
            }
        }
    }

    fn idle_housekeeping(&self) {
        self.flush_acks();
        // A listener registered after messages buffered; delivery picks
        // them up on the next loop iteration now that the sentinel is
        // consumed.
        if self.queue.clear_listener_late() {
            debug!("[session] session {} resuming after late listener registration", self.id);
        }
    }

    fn on_fatal(&self, err: &Error) {
        self.ctx.signals.mark_fatal(&format!("session {} reader: {err}", self.id));
    }
}

/// One broker session: a serialization scope for consuming, producing and
/// transacting.
pub struct Session {
    id: u64,
    inner: Arc<SessionInner>,
    reader: SessionReader,
    txn: Option<TransactionCoordinator>,
}

impl Session {
    /// Register the session with the broker and build its local machinery.
    /// Transacted sessions open their first transaction immediately.
    pub fn new(id: u64, ctx: SessionContext, transacted: bool) -> Result<Self> {
        ctx.transport.get().add_session(id)?;
        let queue = Arc::new(DeliveryQueue::new());
        let inner = Arc::new(SessionInner {
            id,
            ctx: ctx.clone(),
            queue: Arc::clone(&queue),
            consumers: DashMap::new(),
            producers: DashMap::new(),
            unacked: Arc::new(UnackedStore::default()),
            pending_acks: Mutex::new(Vec::new()),
            failover_occurred: Arc::new(AtomicBool::new(false)),
            has_listener: AtomicBool::new(false),
        });
        let reader = SessionReader::new(
            id,
            queue,
            Arc::clone(&inner) as Arc<dyn ReaderEvents>,
            ctx.config.reader_idle_interval,
        );
        let txn = if transacted {
            let coordinator = TransactionCoordinator::new(
                id,
                TxnContext {
                    transport: ctx.transport.clone(),
                    recovery: Arc::clone(&ctx.recovery),
                    unacked: Arc::clone(&inner.unacked),
                    failover_occurred: Arc::clone(&inner.failover_occurred),
                    xa_registry: Arc::clone(&ctx.xa_registry),
                    is_ha: ctx.config.ha,
                },
            );
            coordinator.start_local()?;
            Some(coordinator)
        } else {
            None
        };
        Ok(Self { id, inner, reader, txn })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        self.reader.queue()
    }

    pub fn txn(&self) -> Option<&TransactionCoordinator> {
        self.txn.as_ref()
    }

    pub fn unacked(&self) -> &Arc<UnackedStore> {
        &self.inner.unacked
    }

    pub fn has_listener(&self) -> bool {
        self.inner.has_listener.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn start(&self) {
        self.reader.start();
    }

    pub fn stop(&self, do_wait: bool) {
        self.reader.stop(do_wait);
    }

    /// Close the session and everything it owns. Consumer deregistration
    /// failures are logged; close never fails.
    pub fn close(&self) {
        for entry in self.inner.consumers.iter() {
            let id = *entry.key();
            entry.value().close();
            self.inner.ctx.flow.deregister_consumer(id);
            if let Err(e) = self.inner.ctx.transport.get().delete_consumer(id) {
                debug!("[session] session {} delete_consumer({id}) on close: {e}", self.id);
            }
        }
        self.inner.consumers.clear();
        self.inner.flush_acks();
        self.reader.close();
    }

    // ========================================================================
    // Consumers and producers
    // ========================================================================

    /// Register a consumer with the broker and start routing to its
    /// callback. A registration that arrives after messages already
    /// buffered wakes the reader for late delivery.
    pub fn add_consumer(
        &self,
        id: ConsumerId,
        spec: ConsumerSpec,
        prefetch_max: u32,
        callback: MessageCallback,
    ) -> Result<Arc<ConsumerHandle>> {
        self.inner.ctx.transport.get().add_consumer(id, &spec)?;
        self.inner.ctx.flow.register_consumer(id, prefetch_max);
        let handle = Arc::new(ConsumerHandle::new(id, spec, prefetch_max, callback));
        self.inner.consumers.insert(id, Arc::clone(&handle));
        let first_listener = !self.inner.has_listener.swap(true, Ordering::SeqCst);
        if first_listener && !self.queue().is_empty() {
            self.queue().set_listener_late_notify();
        }
        Ok(handle)
    }

    pub fn remove_consumer(&self, id: ConsumerId) -> Result<()> {
        if let Some((_, handle)) = self.inner.consumers.remove(&id) {
            handle.close();
        }
        self.inner.ctx.flow.deregister_consumer(id);
        self.inner.ctx.transport.get().delete_consumer(id)
    }

    pub fn add_producer(&self, id: u64, spec: ProducerSpec) -> Result<()> {
        self.inner.ctx.transport.get().add_producer(id, &spec)?;
        self.inner.producers.insert(id, spec);
        Ok(())
    }

    /// Publish one message body.
    pub fn publish(&self, producer_id: u64, body: Vec<u8>) -> Result<()> {
        if !self.inner.producers.contains_key(&producer_id) {
            return Err(Error::IllegalState(format!(
                "session {} has no producer {producer_id}",
                self.id
            )));
        }
        self.inner.ctx.transport.get().send(&Request::new(RequestKind::Produce, body))?;
        self.inner.ctx.flow.note_traffic();
        Ok(())
    }

    // ========================================================================
    // Acknowledgment and redelivery
    // ========================================================================

    /// Queue an acknowledgment for batching; flushes at the batch limit,
    /// otherwise on reader idle.
    pub fn acknowledge(&self, message_id: u64) {
        let flush = {
            let mut pending = self.inner.pending_acks.lock();
            pending.push(message_id);
            pending.len() >= ACK_BATCH
        };
        if flush {
            self.inner.flush_acks();
        }
    }

    /// Discard undelivered buffered messages so the broker redelivers
    /// them. Freed capacity is returned to flow control unconditionally.
    pub fn recover(&self) {
        let discarded = self.queue().clear();
        self.inner.pending_acks.lock().clear();
        self.inner.ctx.flow.reset_flow(FlowKey::Connection, discarded as u32);
        // Each consumer's prefetch window reopens in full; the broker
        // redelivers everything that was buffered.
        for entry in self.inner.consumers.iter() {
            self.inner.ctx.flow.clear_flow(FlowKey::Consumer(*entry.key()));
        }
        debug!("[session] session {} recover discarded {discarded} buffered units", self.id);
    }

    // ========================================================================
    // Recovery cooperation
    // ========================================================================

    /// Reset for failover: wipe unacknowledged state and buffered units.
    /// Rejected when a listener session cannot legally survive reconnect.
    pub fn reset_for_failover(&self) -> Result<()> {
        let cfg = &self.inner.ctx.config;
        if self.has_listener() && !cfg.ha && !cfg.enable_listener_reconnect {
            return Err(Error::IllegalState(format!(
                "session {} has active listeners and listener reconnect is disabled",
                self.id
            )));
        }
        self.inner.unacked.clear();
        self.inner.pending_acks.lock().clear();
        let discarded = self.queue().clear();
        self.inner.ctx.flow.reset_flow(FlowKey::Connection, discarded as u32);
        for entry in self.inner.consumers.iter() {
            self.inner.ctx.flow.clear_flow(FlowKey::Consumer(*entry.key()));
        }
        self.inner.failover_occurred.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Re-register this session and its surviving consumers on the new
    /// transport. Consumers that closed during the race are pruned.
    pub fn rebuild(&self) -> Result<()> {
        let transport = self.inner.ctx.transport.get();
        transport.add_session(self.id)?;
        let mut pruned = Vec::new();
        for entry in self.inner.consumers.iter() {
            let (id, handle) = (*entry.key(), entry.value());
            if handle.is_closed() {
                pruned.push(id);
                continue;
            }
            transport.add_consumer(id, handle.spec())?;
            self.inner.ctx.flow.register_consumer(id, handle.prefetch_max());
        }
        for id in pruned {
            self.inner.consumers.remove(&id);
            self.inner.ctx.flow.deregister_consumer(id);
        }
        Ok(())
    }

    pub fn rebuild_producers(&self) -> Result<()> {
        let transport = self.inner.ctx.transport.get();
        for entry in self.inner.producers.iter() {
            transport.add_producer(*entry.key(), entry.value())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("consumers", &self.inner.consumers.len())
            .field("transacted", &self.txn.is_some())
            .finish()
    }
}
