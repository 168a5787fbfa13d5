// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Crate-internal test doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::delivery::DeliveryUnit;
use crate::error::{Error, Result};
use crate::transport::{
    CommitResult, ConsumerId, ConsumerSpec, CorrelationId, ProducerSpec, Request, TransactionId,
    Transport, VerifyOutcome,
};
use crate::txn::{TxnPhase, XaFlags, Xid};

/// Scriptable in-memory transport. Records every operation by name; each
/// operation can be told to fail (forever or for the next N calls) with a
/// network error.
#[derive(Default)]
pub struct StubTransport {
    calls: Mutex<Vec<&'static str>>,
    /// Remaining failures per op; `u32::MAX` means fail forever.
    fail: Mutex<HashMap<&'static str, u32>>,
    pub broken: AtomicBool,
    txn_counter: AtomicI64,
    pub commit_next: Mutex<Option<TransactionId>>,
    pub verify_outcome: Mutex<Option<VerifyOutcome>>,
    start_flags: Mutex<Vec<Option<XaFlags>>>,
    pub inbound: Mutex<std::collections::VecDeque<DeliveryUnit>>,
}

impl StubTransport {
    pub fn push_inbound(&self, unit: DeliveryUnit) {
        self.inbound.lock().push_back(unit);
    }
}

impl StubTransport {
    pub fn fail_op(&self, op: &'static str) {
        self.fail.lock().insert(op, u32::MAX);
    }

    pub fn fail_op_times(&self, op: &'static str, times: u32) {
        self.fail.lock().insert(op, times);
    }

    pub fn pass_op(&self, op: &'static str) {
        self.fail.lock().remove(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: &'static str) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }

    pub fn join_flag_count(&self) -> usize {
        self.start_flags
            .lock()
            .iter()
            .filter(|f| f.map(|f| f.contains(XaFlags::JOIN)).unwrap_or(false))
            .count()
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

impl Transport for StubTransport {
    fn send(&self, _request: &Request) -> Result<()> {
        self.record("send")
    }

    fn send_and_correlate(&self, _request: &Request) -> Result<CorrelationId> {
        self.record("send_and_correlate")?;
        Ok(1)
    }

    fn receive_next(&self, timeout: Duration) -> Result<Option<DeliveryUnit>> {
        if self.is_broken() {
            return Err(Error::ConnectionBroken("stub link down".into()));
        }
        if let Some(unit) = self.inbound.lock().pop_front() {
            return Ok(Some(unit));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(self.inbound.lock().pop_front())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn reconnect(&self) -> Result<Arc<dyn Transport>> {
        self.record("reconnect")?;
        Ok(Arc::new(StubTransport::default()))
    }

    fn hello(&self) -> Result<()> {
        self.record("hello")
    }

    fn goodbye(&self) -> Result<()> {
        self.record("goodbye")
    }

    fn ping(&self) -> Result<()> {
        self.record("ping")
    }

    fn start_delivery(&self) -> Result<()> {
        self.record("start_delivery")
    }

    fn stop_delivery(&self) -> Result<()> {
        self.record("stop_delivery")
    }

    fn add_session(&self, _session_id: u64) -> Result<()> {
        self.record("add_session")
    }

    fn add_consumer(&self, _consumer_id: ConsumerId, _spec: &ConsumerSpec) -> Result<()> {
        self.record("add_consumer")
    }

    fn delete_consumer(&self, _consumer_id: ConsumerId) -> Result<()> {
        self.record("delete_consumer")
    }

    fn add_producer(&self, _producer_id: u64, _spec: &ProducerSpec) -> Result<()> {
        self.record("add_producer")
    }

    fn resume_connection_flow(&self, _chunk: u32) -> Result<()> {
        self.record("resume_connection_flow")
    }

    fn resume_consumer_flow(&self, _consumer_id: ConsumerId, _grant: u32) -> Result<()> {
        self.record("resume_consumer_flow")
    }

    fn start_transaction(
        &self,
        _current: TransactionId,
        flags: Option<XaFlags>,
        _xid: Option<&Xid>,
    ) -> Result<TransactionId> {
        self.record("start_transaction")?;
        self.start_flags.lock().push(flags);
        Ok(1000 + self.txn_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn end_transaction(
        &self,
        _id: TransactionId,
        _flags: Option<XaFlags>,
        _xid: Option<&Xid>,
    ) -> Result<()> {
        self.record("end_transaction")
    }

    fn prepare_transaction(&self, _id: TransactionId, _xid: Option<&Xid>) -> Result<()> {
        self.record("prepare_transaction")
    }

    fn commit_transaction(
        &self,
        _id: TransactionId,
        _flags: Option<XaFlags>,
        _xid: Option<&Xid>,
    ) -> Result<CommitResult> {
        self.record("commit_transaction")?;
        Ok(CommitResult {
            next_transaction_id: *self.commit_next.lock(),
        })
    }

    fn rollback_transaction(&self, _id: TransactionId, _xid: Option<&Xid>) -> Result<()> {
        self.record("rollback_transaction")
    }

    fn recover_xa(&self, _flags: XaFlags) -> Result<Vec<Xid>> {
        self.record("recover_xa")?;
        Ok(Vec::new())
    }

    fn verify_transaction(&self, _id: TransactionId, _phase: TxnPhase) -> Result<VerifyOutcome> {
        self.record("verify_transaction")?;
        Ok(self.verify_outcome.lock().unwrap_or(VerifyOutcome::RolledBack))
    }
}
