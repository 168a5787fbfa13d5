// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Shared test doubles for the integration suite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use relaymq::{
    Codec, CommitResult, ConsumerId, ConsumerSpec, CorrelationId, DeliveryUnit, Error,
    InboundMessage, ProducerSpec, Request, Result, TransactionId, Transport, TxnPhase,
    VerifyOutcome, XaFlags, Xid,
};

/// State shared across reconnect generations of one mock broker link.
#[derive(Default)]
pub struct BrokerState {
    pub calls: Mutex<Vec<&'static str>>,
    /// Remaining scripted failures per op; `u32::MAX` means fail forever.
    fail: Mutex<HashMap<&'static str, u32>>,
    pub inbound: Mutex<VecDeque<DeliveryUnit>>,
    txn_counter: AtomicI64,
    pub commit_next: Mutex<Option<TransactionId>>,
    pub verify_outcome: Mutex<Option<VerifyOutcome>>,
}

impl BrokerState {
    pub fn fail_op(&self, op: &'static str) {
        self.fail.lock().insert(op, u32::MAX);
    }

    pub fn fail_op_times(&self, op: &'static str, times: u32) {
        self.fail.lock().insert(op, times);
    }

    pub fn pass_op(&self, op: &'static str) {
        self.fail.lock().remove(op);
    }

    pub fn count(&self, op: &'static str) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }

    pub fn push_inbound(&self, unit: DeliveryUnit) {
        self.inbound.lock().push_back(unit);
    }

    fn record(&self, op: &'static str) -> Result<()> {
        self.calls.lock().push(op);
        let mut fail = self.fail.lock();
        if let Some(remaining) = fail.get_mut(op) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(Error::ConnectionBroken(format!("scripted failure: {op}")));
            }
            fail.remove(op);
        }
        Ok(())
    }
}

/// One generation of the mock broker link. `reconnect` hands out a fresh
/// healthy generation sharing the same [`BrokerState`].
pub struct MockTransport {
    pub state: Arc<BrokerState>,
    pub broken: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_state(Arc::new(BrokerState::default()))
    }

    pub fn with_state(state: Arc<BrokerState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            broken: AtomicBool::new(false),
        })
    }

    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn send(&self, _request: &Request) -> Result<()> {
        self.state.record("send")
    }

    fn send_and_correlate(&self, _request: &Request) -> Result<CorrelationId> {
        self.state.record("send_and_correlate")?;
        Ok(1)
    }

    fn receive_next(&self, timeout: Duration) -> Result<Option<DeliveryUnit>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::ConnectionBroken("mock link down".into()));
        }
        if let Some(unit) = self.state.inbound.lock().pop_front() {
            return Ok(Some(unit));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(self.state.inbound.lock().pop_front())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn reconnect(&self) -> Result<Arc<dyn Transport>> {
        self.state.record("reconnect")?;
        Ok(MockTransport::with_state(Arc::clone(&self.state)) as Arc<dyn Transport>)
    }

    fn hello(&self) -> Result<()> {
        self.state.record("hello")
    }

    fn goodbye(&self) -> Result<()> {
        self.state.record("goodbye")
    }

    fn ping(&self) -> Result<()> {
        self.state.record("ping")
    }

    fn start_delivery(&self) -> Result<()> {
        self.state.record("start_delivery")
    }

    fn stop_delivery(&self) -> Result<()> {
        self.state.record("stop_delivery")
    }

    fn add_session(&self, _session_id: u64) -> Result<()> {
        self.state.record("add_session")
    }

    fn add_consumer(&self, _consumer_id: ConsumerId, _spec: &ConsumerSpec) -> Result<()> {
        self.state.record("add_consumer")
    }

    fn delete_consumer(&self, _consumer_id: ConsumerId) -> Result<()> {
        self.state.record("delete_consumer")
    }

    fn add_producer(&self, _producer_id: u64, _spec: &ProducerSpec) -> Result<()> {
        self.state.record("add_producer")
    }

    fn resume_connection_flow(&self, _chunk: u32) -> Result<()> {
        self.state.record("resume_connection_flow")
    }

    fn resume_consumer_flow(&self, _consumer_id: ConsumerId, _grant: u32) -> Result<()> {
        self.state.record("resume_consumer_flow")
    }

    fn start_transaction(
        &self,
        _current: TransactionId,
        _flags: Option<XaFlags>,
        _xid: Option<&Xid>,
    ) -> Result<TransactionId> {
        self.state.record("start_transaction")?;
        Ok(1000 + self.state.txn_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn end_transaction(
        &self,
        _id: TransactionId,
        _flags: Option<XaFlags>,
        _xid: Option<&Xid>,
    ) -> Result<()> {
        self.state.record("end_transaction")
    }

    fn prepare_transaction(&self, _id: TransactionId, _xid: Option<&Xid>) -> Result<()> {
        self.state.record("prepare_transaction")
    }

    fn commit_transaction(
        &self,
        _id: TransactionId,
        _flags: Option<XaFlags>,
        _xid: Option<&Xid>,
    ) -> Result<CommitResult> {
        self.state.record("commit_transaction")?;
        Ok(CommitResult {
            next_transaction_id: *self.state.commit_next.lock(),
        })
    }

    fn rollback_transaction(&self, _id: TransactionId, _xid: Option<&Xid>) -> Result<()> {
        self.state.record("rollback_transaction")
    }

    fn recover_xa(&self, _flags: XaFlags) -> Result<Vec<Xid>> {
        self.state.record("recover_xa")?;
        Ok(Vec::new())
    }

    fn verify_transaction(&self, _id: TransactionId, _phase: TxnPhase) -> Result<VerifyOutcome> {
        self.state.record("verify_transaction")?;
        Ok(self
            .state
            .verify_outcome
            .lock()
            .unwrap_or(VerifyOutcome::RolledBack))
    }
}

/// Decodes the first body byte as the message id.
pub struct MockCodec;

impl Codec for MockCodec {
    fn decode(&self, unit: &DeliveryUnit) -> Result<InboundMessage> {
        let first = unit.body.first().copied().ok_or_else(|| {
            Error::Fatal("empty message body".into())
        })?;
        Ok(InboundMessage {
            consumer_id: unit.consumer_id,
            message_id: u64::from(first),
            priority: unit.priority,
            redelivered: false,
            body: unit.body.clone(),
        })
    }
}
