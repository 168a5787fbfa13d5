// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! The connection hub.
//!
//! [`ConnectionCore`] owns the transport slot, the read channel, the flow
//! controller, the recovery coordinator and every session. It is the sink
//! for inbound units (routing messages to session queues, replies to their
//! waiters) and the context for synchronous round trips. It is also the
//! recovery target: the coordinator drives the rebuild sequence through it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::ack::{AckContext, AckWaiter};
use crate::config::ClientConfig;
use crate::consumer::{ConnectionConsumer, ConsumerHandle, MessageCallback};
use crate::delivery::{DeliveryUnit, UnitKind};
use crate::error::{Error, Result};
use crate::flow::{FlowController, FlowKey};
use crate::reader::{InboundSink, ReadChannel, ReaderEvents};
use crate::recovery::{RecoveryCoordinator, RecoveryTarget};
use crate::session::{Session, SessionContext};
use crate::transport::{
    Codec, ConsumerId, ConsumerSpec, CorrelationId, Request, Transport, TransportCell,
};
use crate::txn::XaRegistry;

/// Cross-thread condition flags for one connection, checked at step
/// boundaries instead of held locks.
#[derive(Debug, Default)]
pub struct ConnectionSignals {
    close_called: AtomicBool,
    broken: AtomicBool,
    stopped: AtomicBool,
    fatal: AtomicBool,
}

impl ConnectionSignals {
    pub fn is_closed(&self) -> bool {
        self.close_called.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.close_called.store(true, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::SeqCst);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn mark_fatal(&self, reason: &str) {
        error!("[connection] fatal: {reason}");
        self.fatal.store(true, Ordering::SeqCst);
    }
}

/// Terminal notifications for an application-installed observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// The connection reconnected and was rebuilt.
    Recovered,
    /// One reconnect attempt failed; retries continue while budget remains.
    AttemptFailed,
    /// The retry budget is spent; the connection is dead.
    Aborted,
}

pub type RecoveryListener = Box<dyn Fn(RecoveryEvent) + Send + Sync>;

/// Where an inbound message unit goes.
#[derive(Debug, Clone, Copy)]
enum Route {
    Session(u64),
    ConnectionScoped,
}

/// One logical broker connection and everything it owns.
pub struct ConnectionCore {
    id: u64,
    config: ClientConfig,
    transport: TransportCell,
    codec: Arc<dyn Codec>,
    signals: Arc<ConnectionSignals>,
    flow: Arc<FlowController>,
    recovery: Arc<RecoveryCoordinator>,
    xa_registry: Arc<XaRegistry>,
    sessions: DashMap<u64, Arc<Session>>,
    connection_consumers: DashMap<ConsumerId, Arc<ConnectionConsumer>>,
    /// consumer id -> owning queue, maintained on every (de)registration.
    interests: DashMap<ConsumerId, Route>,
    pending: DashMap<CorrelationId, Arc<AckWaiter>>,
    /// Replies that raced ahead of their waiter's registration. Stashed
    /// only while a round trip is between send and registration; a reply
    /// with no waiter outside that window is late and dropped.
    orphan_replies: DashMap<CorrelationId, DeliveryUnit>,
    /// Round trips currently between send and waiter registration.
    registering: AtomicUsize,
    channel: Mutex<Option<ReadChannel>>,
    recovery_listener: Mutex<Option<RecoveryListener>>,
    next_entity_id: AtomicU64,
    /// Back-reference so the inbound sink can hand an owning Arc to the
    /// recovery coordinator.
    weak_self: Mutex<std::sync::Weak<ConnectionCore>>,
}

impl ConnectionCore {
    /// Handshake with the broker and bring up the background machinery
    /// (flow dispatcher and read channel).
    pub fn connect(
        id: u64,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        transport.hello()?;
        let cell = TransportCell::new(transport);
        let flow = FlowController::new(id, cell.clone(), &config);
        let recovery = RecoveryCoordinator::new(id, config.recover_delay, config.max_recover_retries);
        let core = Arc::new(Self {
            id,
            transport: cell.clone(),
            codec,
            signals: Arc::new(ConnectionSignals::default()),
            flow: Arc::clone(&flow),
            recovery,
            xa_registry: Arc::new(XaRegistry::new()),
            sessions: DashMap::new(),
            connection_consumers: DashMap::new(),
            interests: DashMap::new(),
            pending: DashMap::new(),
            orphan_replies: DashMap::new(),
            registering: AtomicUsize::new(0),
            channel: Mutex::new(None),
            recovery_listener: Mutex::new(None),
            next_entity_id: AtomicU64::new(1),
            weak_self: Mutex::new(std::sync::Weak::new()),
            config,
        });
        *core.weak_self.lock() = Arc::downgrade(&core);
        flow.start();
        let channel = ReadChannel::new(
            id,
            cell,
            Arc::clone(&core) as Arc<dyn InboundSink>,
            core.config.reader_idle_interval,
        );
        channel.start();
        *core.channel.lock() = Some(channel);
        info!("[connection] connection {id} established");
        Ok(core)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signals(&self) -> &Arc<ConnectionSignals> {
        &self.signals
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub fn next_entity_id(&self) -> u64 {
        self.next_entity_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn set_recovery_listener(&self, listener: RecoveryListener) {
        *self.recovery_listener.lock() = Some(listener);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Ask the broker to begin delivery and unlock every reader.
    pub fn start(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.get().start_delivery()?;
        self.flow.note_traffic();
        self.signals.set_stopped(false);
        for session in self.sessions.iter() {
            session.start();
        }
        for cc in self.connection_consumers.iter() {
            cc.start();
        }
        Ok(())
    }

    /// Stop delivery; buffered units are kept and readers park.
    pub fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.get().stop_delivery()?;
        self.flow.note_traffic();
        self.signals.set_stopped(true);
        for session in self.sessions.iter() {
            session.stop(true);
        }
        for cc in self.connection_consumers.iter() {
            cc.stop(true);
        }
        Ok(())
    }

    /// Tear the connection down. Idempotent; a failed goodbye is logged,
    /// never raised.
    pub fn close(&self) {
        if self.signals.is_closed() {
            return;
        }
        self.signals.mark_closed();
        if let Err(e) = self.transport.get().goodbye() {
            debug!("[connection] connection {} goodbye failed: {e}", self.id);
        }
        self.recovery.close();
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        for entry in self.pending.iter() {
            entry.value().close();
        }
        self.pending.clear();
        for session in self.sessions.iter() {
            session.close();
        }
        self.sessions.clear();
        for cc in self.connection_consumers.iter() {
            cc.close();
        }
        self.connection_consumers.clear();
        self.flow.close();
        info!("[connection] connection {} closed", self.id);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.signals.is_closed() {
            return Err(Error::Closed);
        }
        if self.signals.is_fatal() || self.recovery.is_aborted() {
            return Err(Error::Fatal(format!("connection {} is dead", self.id)));
        }
        Ok(())
    }

    // ========================================================================
    // Sessions and consumers
    // ========================================================================

    pub fn create_session(self: &Arc<Self>, transacted: bool) -> Result<Arc<Session>> {
        self.ensure_open()?;
        let session_id = self.next_entity_id();
        let session = Arc::new(Session::new(session_id, self.session_context(), transacted)?);
        self.sessions.insert(session_id, Arc::clone(&session));
        if !self.signals.is_stopped() {
            session.start();
        }
        Ok(session)
    }

    pub fn close_session(&self, session_id: u64) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            session.close();
        }
    }

    /// Register a consumer on `session` and record the routing interest so
    /// the read channel can find its queue.
    pub fn add_consumer(
        &self,
        session: &Arc<Session>,
        spec: ConsumerSpec,
        prefetch_max: u32,
        callback: MessageCallback,
    ) -> Result<Arc<ConsumerHandle>> {
        self.ensure_open()?;
        let consumer_id = self.next_entity_id();
        let handle = session.add_consumer(consumer_id, spec, prefetch_max, callback)?;
        self.interests.insert(consumer_id, Route::Session(session.id()));
        Ok(handle)
    }

    pub fn remove_consumer(&self, session: &Arc<Session>, consumer_id: ConsumerId) -> Result<()> {
        self.interests.remove(&consumer_id);
        session.remove_consumer(consumer_id)
    }

    /// Create a connection-scoped consumer with its own queue and reader.
    pub fn create_connection_consumer(
        self: &Arc<Self>,
        spec: ConsumerSpec,
        prefetch_max: u32,
        callback: MessageCallback,
    ) -> Result<Arc<ConnectionConsumer>> {
        self.ensure_open()?;
        let consumer_id = self.next_entity_id();
        self.transport.get().add_consumer(consumer_id, &spec)?;
        self.flow.register_consumer(consumer_id, prefetch_max);
        let handle = Arc::new(ConsumerHandle::new(consumer_id, spec, prefetch_max, callback));
        let events = Arc::new(ConnectionConsumerEvents {
            handle: Arc::clone(&handle),
            core: Arc::clone(self),
        });
        let cc = Arc::new(ConnectionConsumer::new(
            handle,
            events as Arc<dyn ReaderEvents>,
            self.config.reader_idle_interval,
        ));
        self.connection_consumers.insert(consumer_id, Arc::clone(&cc));
        self.interests.insert(consumer_id, Route::ConnectionScoped);
        if !self.signals.is_stopped() {
            cc.start();
        }
        Ok(cc)
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            transport: self.transport.clone(),
            flow: Arc::clone(&self.flow),
            recovery: Arc::clone(&self.recovery),
            signals: Arc::clone(&self.signals),
            codec: Arc::clone(&self.codec),
            xa_registry: Arc::clone(&self.xa_registry),
            config: self.config.clone(),
        }
    }

    // ========================================================================
    // Synchronous round trips
    // ========================================================================

    /// Send a request and block for its correlated reply.
    pub fn request_reply(&self, request: Request, timeout: Duration) -> Result<DeliveryUnit> {
        self.ensure_open()?;
        let waiter = Arc::new(AckWaiter::new());
        self.registering.fetch_add(1, Ordering::SeqCst);
        let correlation = match self.transport.get().send_and_correlate(&request) {
            Ok(correlation) => correlation,
            Err(e) => {
                self.registering.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.flow.note_traffic();
        self.pending.insert(correlation, Arc::clone(&waiter));
        self.registering.fetch_sub(1, Ordering::SeqCst);
        // The reply may have landed before the waiter was registered.
        if let Some((_, unit)) = self.orphan_replies.remove(&correlation) {
            waiter.on_reply(unit);
        }
        let result = waiter.await_reply(self, &request, timeout);
        self.pending.remove(&correlation);
        // A reply that landed between the wait giving up and this point
        // must not outlive its round trip.
        self.orphan_replies.remove(&correlation);
        result
    }

    /// Recovery is needed; hand the rebuild to the coordinator.
    pub fn begin_recovery(self: &Arc<Self>) {
        self.recovery
            .start(Arc::clone(self) as Arc<dyn RecoveryTarget>);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.is_recovering()
    }

    pub fn await_recovery_inactive(&self) -> Result<()> {
        self.recovery.wait_until_inactive()
    }
}

// ============================================================================
// Inbound routing
// ============================================================================

impl InboundSink for ConnectionCore {
    fn route(&self, unit: DeliveryUnit) {
        match unit.kind {
            UnitKind::Reply => {
                let correlation = unit.consumer_id;
                match self.pending.get(&correlation) {
                    Some(waiter) => waiter.on_reply(unit),
                    None if self.registering.load(Ordering::SeqCst) > 0 => {
                        self.orphan_replies.insert(correlation, unit);
                    }
                    None => {
                        // Its round trip already gave up.
                        debug!("[connection] dropping reply for retired correlation {correlation}");
                    }
                }
            }
            UnitKind::Message => {
                let consumer_id = unit.consumer_id;
                self.flow.message_received(FlowKey::Consumer(consumer_id));
                self.flow.message_received(FlowKey::Connection);
                // Broker pause markers piggybacked on the unit.
                if unit.last_in_batch {
                    self.flow.request_resume(FlowKey::Consumer(consumer_id));
                }
                if unit.flow_paused {
                    self.flow.request_resume(FlowKey::Connection);
                }
                let route = self.interests.get(&consumer_id).map(|r| *r.value());
                match route {
                    Some(Route::Session(session_id)) => {
                        if let Some(session) = self.sessions.get(&session_id) {
                            session.queue().enqueue(unit);
                        } else {
                            debug!("[connection] session {session_id} gone, dropping unit");
                            self.flow.message_delivered(FlowKey::Consumer(consumer_id));
                            self.flow.message_delivered(FlowKey::Connection);
                        }
                    }
                    Some(Route::ConnectionScoped) => {
                        if let Some(cc) = self.connection_consumers.get(&consumer_id) {
                            if cc.is_failing_over() {
                                trace!("[connection] consumer {consumer_id} failing over, dropping unit");
                                self.flow.message_delivered(FlowKey::Consumer(consumer_id));
                                self.flow.message_delivered(FlowKey::Connection);
                            } else {
                                cc.queue().enqueue(unit);
                            }
                        }
                    }
                    None => {
                        // Benign race with a concurrent consumer close.
                        debug!("[connection] no interest for consumer {consumer_id}, dropping unit");
                        self.flow.message_delivered(FlowKey::Consumer(consumer_id));
                        self.flow.message_delivered(FlowKey::Connection);
                    }
                }
            }
            UnitKind::Control => {
                trace!("[connection] control unit received ({} bytes)", unit.body.len());
            }
        }
    }

    fn on_transport_broken(&self, err: &Error) {
        if self.signals.is_closed() || self.recovery.is_aborted() {
            return;
        }
        if self.recovery.is_recovering() {
            return;
        }
        warn!("[connection] connection {} transport broken: {err}", self.id);
        self.signals.set_broken(true);
        if let Some(core) = self.weak_self.lock().upgrade() {
            core.begin_recovery();
        }
    }

    fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }
}

// ============================================================================
// Ack context
// ============================================================================

impl AckContext for ConnectionCore {
    fn is_broken(&self) -> bool {
        self.signals.is_closed() || self.signals.is_fatal() || self.recovery.is_aborted()
    }

    fn is_recovering(&self) -> bool {
        self.recovery.is_recovering()
    }

    fn is_ha(&self) -> bool {
        self.config.ha
    }

    fn resend(&self, request: &Request) -> Result<()> {
        self.transport.get().send(request)?;
        self.flow.note_traffic();
        Ok(())
    }

    fn dump_state(&self) -> String {
        format!(
            "connection {}: sessions={} pending={} recovery={} flow_ready={:?}",
            self.id,
            self.sessions.len(),
            self.pending.len(),
            self.recovery.state(),
            self.flow.ready_keys(),
        )
    }
}

// ============================================================================
// Recovery target
// ============================================================================

impl RecoveryTarget for ConnectionCore {
    fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }

    fn reconnect_transport(&self) -> Result<()> {
        let replacement = self.transport.get().reconnect()?;
        self.transport.swap(replacement);
        self.signals.set_broken(false);
        Ok(())
    }

    fn prepare_failover(&self) {
        for cc in self.connection_consumers.iter() {
            cc.begin_failover();
        }
    }

    fn reset_sessions(&self) -> Result<()> {
        // Pending replies reference the dead transport.
        for entry in self.pending.iter() {
            entry.value().close();
        }
        self.pending.clear();
        self.orphan_replies.clear();
        for session in self.sessions.iter() {
            session.reset_for_failover()?;
        }
        Ok(())
    }

    fn handshake(&self) -> Result<()> {
        self.transport.get().hello()
    }

    fn rebuild_sessions(&self) -> Result<()> {
        for session in self.sessions.iter() {
            session.rebuild()?;
        }
        Ok(())
    }

    fn rebuild_consumers(&self) -> Result<()> {
        let transport = self.transport.get();
        let mut pruned = Vec::new();
        for entry in self.connection_consumers.iter() {
            let (id, cc) = (*entry.key(), entry.value());
            if cc.handle().is_closed() {
                pruned.push(id);
                continue;
            }
            transport.add_consumer(id, cc.handle().spec())?;
            self.flow.register_consumer(id, cc.handle().prefetch_max());
        }
        for id in pruned {
            self.connection_consumers.remove(&id);
            self.interests.remove(&id);
            self.flow.deregister_consumer(id);
        }
        Ok(())
    }

    fn release_failover(&self) {
        for cc in self.connection_consumers.iter() {
            cc.end_failover();
        }
    }

    fn rebuild_producers(&self) -> Result<()> {
        for session in self.sessions.iter() {
            session.rebuild_producers()?;
        }
        Ok(())
    }

    fn resume_delivery(&self) -> Result<()> {
        if self.signals.is_stopped() {
            return Ok(());
        }
        self.transport.get().start_delivery()?;
        self.flow.note_traffic();
        for session in self.sessions.iter() {
            session.start();
        }
        for cc in self.connection_consumers.iter() {
            cc.start();
        }
        Ok(())
    }

    fn on_recovered(&self) {
        if let Some(listener) = self.recovery_listener.lock().as_ref() {
            listener(RecoveryEvent::Recovered);
        }
    }

    fn on_attempt_failed(&self, _err: &Error) {
        if let Some(listener) = self.recovery_listener.lock().as_ref() {
            listener(RecoveryEvent::AttemptFailed);
        }
    }

    fn on_aborted(&self, err: &Error) {
        self.signals.mark_fatal(&format!("recovery aborted: {err}"));
        for entry in self.pending.iter() {
            entry.value().close();
        }
        if let Some(listener) = self.recovery_listener.lock().as_ref() {
            listener(RecoveryEvent::Aborted);
        }
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .field("recovery", &self.recovery.state())
            .finish()
    }
}

/// Reader event adapter for a connection-scoped consumer: delivery goes
/// straight to the handle, everything else defers to the connection.
struct ConnectionConsumerEvents {
    handle: Arc<ConsumerHandle>,
    core: Arc<ConnectionCore>,
}

impl ReaderEvents for ConnectionConsumerEvents {
    fn is_transport_broken(&self) -> bool {
        self.core.signals.is_fatal() || self.core.recovery.is_aborted()
    }

    fn is_recovering(&self) -> bool {
        self.core.recovery.is_recovering()
    }

    fn dispatch(&self, unit: DeliveryUnit) -> Result<()> {
        let consumer_id = unit.consumer_id;
        let message = self.core.codec.decode(&unit)?;
        self.handle.deliver(message);
        self.core.flow.message_delivered(FlowKey::Consumer(consumer_id));
        self.core.flow.message_delivered(FlowKey::Connection);
        Ok(())
    }

    fn idle_housekeeping(&self) {}

    fn on_fatal(&self, err: &Error) {
        self.core
            .signals
            .mark_fatal(&format!("connection consumer {} reader: {err}", self.handle.id()));
    }
}
