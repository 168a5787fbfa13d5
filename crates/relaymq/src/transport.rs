// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Transport and codec collaborator contracts.
//!
//! The engine is wire-agnostic: everything it needs from the broker link is
//! expressed by the [`Transport`] trait (opaque send/receive plus the typed
//! broker control operations the core invokes) and the [`Codec`] trait
//! (message body decoding). Implementations live outside this crate.
//!
//! [`TransportCell`] is the connection's shared transport slot: recovery
//! swaps in the reconnected transport atomically while reader, flow and
//! transaction code keep loading the current one lock-free.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::delivery::DeliveryUnit;
use crate::error::Result;
use crate::txn::{TxnPhase, Xid};

/// Correlation id for a request expecting a reply.
pub type CorrelationId = u64;
/// Broker-assigned consumer identity.
pub type ConsumerId = u64;
/// Broker-assigned transaction identity (-1 = unassigned).
pub type TransactionId = i64;

// ============================================================================
// Requests
// ============================================================================

/// Operation discriminator for an outbound request.
///
/// Doubles as the resend policy table: on an ack timeout only the kinds in
/// [`RequestKind::is_resendable`] may be retransmitted, and only on an HA
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Hello,
    Goodbye,
    Ping,
    StartDelivery,
    StopDelivery,
    AddSession,
    AddConsumer,
    DeleteConsumer,
    AddProducer,
    ResumeConnectionFlow,
    ResumeConsumerFlow,
    StartTransaction,
    EndTransaction,
    PrepareTransaction,
    CommitTransaction,
    RollbackTransaction,
    VerifyTransaction,
    Acknowledge,
    Produce,
}

impl RequestKind {
    /// Allow-list of idempotent control-plane kinds that may be resent on
    /// an ack timeout against an HA broker. Data-plane kinds (`Produce`,
    /// `Acknowledge`) and transaction outcome kinds are deliberately
    /// excluded: resending those risks duplicate effects.
    pub fn is_resendable(self) -> bool {
        matches!(
            self,
            RequestKind::Hello
                | RequestKind::Ping
                | RequestKind::StartDelivery
                | RequestKind::StopDelivery
                | RequestKind::AddSession
                | RequestKind::AddConsumer
                | RequestKind::DeleteConsumer
                | RequestKind::AddProducer
                | RequestKind::StartTransaction
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Hello => "HELLO",
            RequestKind::Goodbye => "GOODBYE",
            RequestKind::Ping => "PING",
            RequestKind::StartDelivery => "START_DELIVERY",
            RequestKind::StopDelivery => "STOP_DELIVERY",
            RequestKind::AddSession => "ADD_SESSION",
            RequestKind::AddConsumer => "ADD_CONSUMER",
            RequestKind::DeleteConsumer => "DELETE_CONSUMER",
            RequestKind::AddProducer => "ADD_PRODUCER",
            RequestKind::ResumeConnectionFlow => "RESUME_CONNECTION_FLOW",
            RequestKind::ResumeConsumerFlow => "RESUME_CONSUMER_FLOW",
            RequestKind::StartTransaction => "START_TRANSACTION",
            RequestKind::EndTransaction => "END_TRANSACTION",
            RequestKind::PrepareTransaction => "PREPARE_TRANSACTION",
            RequestKind::CommitTransaction => "COMMIT_TRANSACTION",
            RequestKind::RollbackTransaction => "ROLLBACK_TRANSACTION",
            RequestKind::VerifyTransaction => "VERIFY_TRANSACTION",
            RequestKind::Acknowledge => "ACKNOWLEDGE",
            RequestKind::Produce => "PRODUCE",
        }
    }
}

/// An outbound protocol request (opaque body, typed kind).
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: RequestKind,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(kind: RequestKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    pub fn control(kind: RequestKind) -> Self {
        Self { kind, body: Vec::new() }
    }
}

// ============================================================================
// Entity specs
// ============================================================================

/// Everything the broker needs to (re-)register a consumer interest.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub destination: String,
    pub selector: Option<String>,
    pub durable_name: Option<String>,
}

/// Everything the broker needs to (re-)register a producer.
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    pub destination: String,
}

// ============================================================================
// Transaction outcomes
// ============================================================================

/// Successful commit reply. The broker piggybacks the id of the next local
/// transaction so the client can skip one start round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitResult {
    pub next_transaction_id: Option<TransactionId>,
}

/// Authoritative outcome of a transaction whose commit result was lost to a
/// network failure, as reported by the verify round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The commit went through before the failure.
    Committed,
    /// The broker still holds the transaction prepared; a fresh commit for
    /// the same id completes it.
    Prepared,
    /// Any other state: the broker rolled the transaction back.
    RolledBack,
}

// ============================================================================
// Traits
// ============================================================================

/// The broker link. One instance per physical connection; recovery replaces
/// the instance via [`Transport::reconnect`] after breakage.
///
/// All methods must be callable from multiple threads.
pub trait Transport: Send + Sync {
    /// Fire-and-forget write.
    fn send(&self, request: &Request) -> Result<()>;

    /// Write a request expecting a reply; returns the correlation id the
    /// reply will carry.
    fn send_and_correlate(&self, request: &Request) -> Result<CorrelationId>;

    /// Pull the next inbound unit, or `None` if `timeout` elapses.
    fn receive_next(&self, timeout: Duration) -> Result<Option<DeliveryUnit>>;

    /// Whether the link has failed. Once true, stays true for this instance.
    fn is_broken(&self) -> bool;

    /// Establish a replacement link (possibly to a failover peer).
    fn reconnect(&self) -> Result<Arc<dyn Transport>>;

    // ------------------------------------------------------------------
    // Broker control operations
    // ------------------------------------------------------------------

    /// Protocol handshake; repeated after every reconnect.
    fn hello(&self) -> Result<()>;
    fn goodbye(&self) -> Result<()>;
    fn ping(&self) -> Result<()>;

    fn start_delivery(&self) -> Result<()>;
    fn stop_delivery(&self) -> Result<()>;

    fn add_session(&self, session_id: u64) -> Result<()>;
    fn add_consumer(&self, consumer_id: ConsumerId, spec: &ConsumerSpec) -> Result<()>;
    fn delete_consumer(&self, consumer_id: ConsumerId) -> Result<()>;
    fn add_producer(&self, producer_id: u64, spec: &ProducerSpec) -> Result<()>;

    /// Connection-scoped resume grant (fixed chunk of messages).
    fn resume_connection_flow(&self, chunk: u32) -> Result<()>;
    /// Consumer-scoped resume grant (0 = unlimited).
    fn resume_consumer_flow(&self, consumer_id: ConsumerId, grant: u32) -> Result<()>;

    /// Open a transaction; the broker assigns and returns the id. `current`
    /// carries the client's cached id when rejoining a known branch, 0
    /// otherwise.
    fn start_transaction(
        &self,
        current: TransactionId,
        flags: Option<crate::txn::XaFlags>,
        xid: Option<&Xid>,
    ) -> Result<TransactionId>;
    fn end_transaction(
        &self,
        id: TransactionId,
        flags: Option<crate::txn::XaFlags>,
        xid: Option<&Xid>,
    ) -> Result<()>;
    fn prepare_transaction(&self, id: TransactionId, xid: Option<&Xid>) -> Result<()>;
    fn commit_transaction(
        &self,
        id: TransactionId,
        flags: Option<crate::txn::XaFlags>,
        xid: Option<&Xid>,
    ) -> Result<CommitResult>;
    fn rollback_transaction(&self, id: TransactionId, xid: Option<&Xid>) -> Result<()>;

    /// List the distributed branches the broker holds in doubt (prepared
    /// but unresolved), for transaction-manager recovery scans.
    fn recover_xa(&self, flags: crate::txn::XaFlags) -> Result<Vec<Xid>>;

    /// Post-reconnect outcome query for a transaction whose commit reply
    /// was lost; `phase` is the last phase the client saw succeed.
    fn verify_transaction(&self, id: TransactionId, phase: TxnPhase) -> Result<VerifyOutcome>;
}

/// A decoded broker message, ready for a consumer callback.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub consumer_id: ConsumerId,
    pub message_id: u64,
    pub priority: u8,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Message body (de)serialization. A decode failure is an engine-level
/// fault, not an application callback error: the reader treats it as fatal.
pub trait Codec: Send + Sync {
    fn decode(&self, unit: &DeliveryUnit) -> Result<InboundMessage>;
}

// ============================================================================
// Shared transport slot
// ============================================================================

/// Sized holder for the transport object; `ArcSwap` slots require one.
struct Slot(Arc<dyn Transport>);

/// Lock-free shared slot holding the connection's current transport.
///
/// Readers (`get`) never block; recovery swaps the reconnected instance in
/// with `swap` and every subsequent load observes it.
#[derive(Clone)]
pub struct TransportCell {
    inner: Arc<ArcSwap<Slot>>,
}

impl TransportCell {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(Slot(transport))),
        }
    }

    /// Current transport instance.
    pub fn get(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.load().0)
    }

    /// Replace the transport (recovery only). Returns the old instance.
    pub fn swap(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        let old = self.inner.swap(Arc::new(Slot(transport)));
        Arc::clone(&old.0)
    }
}

impl std::fmt::Debug for TransportCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportCell")
    }
}
