// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Transaction lifecycle, local and distributed.
//!
//! A local commit is one round trip; the broker piggybacks the next
//! transaction id on the reply so the follow-up start is free. Against an
//! HA broker the commit is three phases (end, prepare, commit), and a
//! network failure after `end` succeeded never guesses the outcome: the
//! coordinator waits out recovery and asks the broker to verify the
//! transaction by id and last-known phase. A failure before `end` needs no
//! verify, the broker never saw the transaction complete.

mod xa;

pub use xa::{XaFlags, XaRegistry, Xid};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::recovery::RecoveryCoordinator;
use crate::session::UnackedStore;
use crate::transport::{CommitResult, TransactionId, TransportCell, VerifyOutcome};

/// Where a transaction stands in its lifecycle. Carried on the verify
/// round trip as the last phase the client saw succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Started,
    Ended,
    Prepared,
    Committed,
    RollbackOnly,
}

/// Connection-side collaborators the coordinator drives.
#[derive(Clone)]
pub struct TxnContext {
    pub transport: TransportCell,
    pub recovery: Arc<RecoveryCoordinator>,
    /// Session bookkeeping for messages consumed but not yet settled.
    pub unacked: Arc<UnackedStore>,
    /// Set by recovery when this session's broker-side state was rebuilt;
    /// a pending rollback must then skip the wire (the broker already
    /// discarded the transaction).
    pub failover_occurred: Arc<AtomicBool>,
    pub xa_registry: Arc<XaRegistry>,
    pub is_ha: bool,
}

#[derive(Debug)]
struct TxnState {
    /// Broker-assigned id, -1 until assigned.
    transaction_id: TransactionId,
    xid: Option<Xid>,
    phase: TxnPhase,
    /// Piggybacked id for the next local transaction.
    next_id: Option<TransactionId>,
}

impl Default for TxnState {
    fn default() -> Self {
        Self {
            transaction_id: -1,
            xid: None,
            phase: TxnPhase::Started,
            next_id: None,
        }
    }
}

/// One coordinator per transacted session.
pub struct TransactionCoordinator {
    session_id: u64,
    ctx: TxnContext,
    state: Mutex<TxnState>,
}

impl TransactionCoordinator {
    pub fn new(session_id: u64, ctx: TxnContext) -> Self {
        Self {
            session_id,
            ctx,
            state: Mutex::new(TxnState::default()),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.state.lock().transaction_id
    }

    pub fn is_active(&self) -> bool {
        self.transaction_id() >= 0
    }

    // ========================================================================
    // Local transactions
    // ========================================================================

    /// Open a local transaction. Uses the id piggybacked on the previous
    /// commit reply when available, otherwise a start round trip.
    pub fn start_local(&self) -> Result<TransactionId> {
        {
            let mut st = self.state.lock();
            if st.transaction_id >= 0 {
                return Err(Error::IllegalState(format!(
                    "session {} already has transaction {}",
                    self.session_id, st.transaction_id
                )));
            }
            if let Some(id) = st.next_id.take() {
                st.transaction_id = id;
                st.phase = TxnPhase::Started;
                st.xid = None;
                debug!("[txn] session {} reusing piggybacked transaction {id}", self.session_id);
                return Ok(id);
            }
        }
        let id = self.ctx.transport.get().start_transaction(0, None, None)?;
        let mut st = self.state.lock();
        st.transaction_id = id;
        st.phase = TxnPhase::Started;
        st.xid = None;
        Ok(id)
    }

    /// Commit the active transaction. Dispatches to the HA three-phase
    /// protocol when connected to an HA broker.
    pub fn commit(&self) -> Result<()> {
        let id = self.active_id()?;
        if self.ctx.is_ha {
            self.commit_ha(id)
        } else {
            self.commit_local(id)
        }
    }

    fn commit_local(&self, id: TransactionId) -> Result<()> {
        match self.ctx.transport.get().commit_transaction(id, None, None) {
            Ok(res) => {
                self.finish_success(res);
                Ok(())
            }
            Err(e) if e.is_network() => self.fail_rollback(id, e),
            Err(e) => {
                // Broker rejected the commit; the transaction is gone
                // either way, so the bookkeeping goes with it.
                self.ctx.unacked.clear();
                self.reset_and_start_fresh();
                Err(e)
            }
        }
    }

    fn commit_ha(&self, id: TransactionId) -> Result<()> {
        // Phase 1: end. A network failure here means the broker never saw
        // the transaction complete; rolled back by definition, no verify.
        if let Err(e) = self.ctx.transport.get().end_transaction(id, None, None) {
            return if e.is_network() {
                self.fail_rollback(id, e)
            } else {
                self.ctx.unacked.clear();
                self.reset_and_start_fresh();
                Err(e)
            };
        }
        self.set_phase(TxnPhase::Ended);

        // Phase 2: prepare.
        match self.ctx.transport.get().prepare_transaction(id, None) {
            Ok(()) => self.set_phase(TxnPhase::Prepared),
            Err(e) if e.is_network() => {
                return self.check_commit_status(id, TxnPhase::Ended, e);
            }
            Err(e) => return self.fail_rollback(id, e),
        }

        // Phase 3: commit.
        match self.ctx.transport.get().commit_transaction(id, None, None) {
            Ok(res) => {
                self.finish_success(res);
                Ok(())
            }
            Err(e) if e.is_network() => self.check_commit_status(id, TxnPhase::Prepared, e),
            Err(e) => self.fail_rollback(id, e),
        }
    }

    /// Resolve an in-doubt commit after a mid-protocol network failure:
    /// wait for recovery to settle, then ask the broker for the
    /// authoritative outcome.
    fn check_commit_status(&self, id: TransactionId, last_phase: TxnPhase, cause: Error) -> Result<()> {
        info!(
            "[txn] session {} transaction {id} in doubt after {last_phase:?} ({cause}), verifying",
            self.session_id
        );
        if let Err(e) = self.ctx.recovery.wait_until_inactive() {
            warn!("[txn] session {} cannot verify transaction {id}: {e}", self.session_id);
            return self.fail_rollback(id, cause);
        }
        match self.ctx.transport.get().verify_transaction(id, last_phase) {
            Ok(VerifyOutcome::Committed) => {
                debug!("[txn] session {} transaction {id} committed before failure", self.session_id);
                self.finish_success(CommitResult::default());
                Ok(())
            }
            Ok(VerifyOutcome::Prepared) => {
                // The broker still holds it prepared; one fresh commit
                // settles it.
                match self.ctx.transport.get().commit_transaction(id, None, None) {
                    Ok(res) => {
                        self.finish_success(res);
                        Ok(())
                    }
                    Err(e) => self.fail_rollback(id, e),
                }
            }
            Ok(VerifyOutcome::RolledBack) => self.fail_rollback(id, cause),
            Err(e) => self.fail_rollback(id, e),
        }
    }

    /// Roll back the active transaction. Skips the wire when failover
    /// already discarded the broker-side transaction.
    pub fn rollback(&self) -> Result<()> {
        let id = self.active_id()?;
        let skip_wire = self.ctx.failover_occurred.swap(false, Ordering::SeqCst);
        let result = if skip_wire {
            debug!(
                "[txn] session {} skipping wire rollback of {id}, failover already discarded it",
                self.session_id
            );
            Ok(())
        } else {
            self.ctx.transport.get().rollback_transaction(id, None)
        };
        self.ctx.unacked.clear();
        self.reset_and_start_fresh();
        result
    }

    // ========================================================================
    // Distributed (XA) transactions
    // ========================================================================

    /// Start or join the branch identified by `xid`. The registry decides:
    /// the first resource to enlist starts the branch on the broker, later
    /// ones join it.
    pub fn start_xa(&self, xid: &Xid, resource_id: u64) -> Result<TransactionId> {
        let created = self.ctx.xa_registry.enlist(xid, resource_id);
        let id = if created {
            let id = self
                .ctx
                .transport
                .get()
                .start_transaction(0, Some(XaFlags::NONE), Some(xid))?;
            self.ctx.xa_registry.bind_transaction(xid, id);
            id
        } else {
            let known = self.ctx.xa_registry.transaction_for(xid).ok_or_else(|| {
                Error::IllegalState(format!("branch {xid} enlisted but never started"))
            })?;
            self.ctx
                .transport
                .get()
                .start_transaction(known, Some(XaFlags::JOIN), Some(xid))?
        };
        let mut st = self.state.lock();
        st.transaction_id = id;
        st.xid = Some(xid.clone());
        st.phase = TxnPhase::Started;
        Ok(id)
    }

    /// End this session's work in the branch. `XaFlags::FAIL` marks the
    /// branch rollback-only.
    pub fn end_xa(&self, xid: &Xid, flags: XaFlags) -> Result<()> {
        let id = self.xa_id(xid)?;
        self.ctx.transport.get().end_transaction(id, Some(flags), Some(xid))?;
        let mut st = self.state.lock();
        st.phase = if flags.contains(XaFlags::FAIL) {
            TxnPhase::RollbackOnly
        } else {
            TxnPhase::Ended
        };
        drop(st);
        if flags.contains(XaFlags::SUCCESS) {
            self.ctx.xa_registry.mark_complete(xid);
        }
        Ok(())
    }

    pub fn prepare_xa(&self, xid: &Xid) -> Result<()> {
        let id = self.xa_id(xid)?;
        self.ctx.transport.get().prepare_transaction(id, Some(xid))?;
        self.set_phase(TxnPhase::Prepared);
        Ok(())
    }

    /// Commit the branch. A network failure mid-commit never guesses the
    /// outcome: the broker is asked to verify once recovery settles, and a
    /// branch it still holds prepared gets one fresh commit.
    pub fn commit_xa(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let id = self.xa_id(xid)?;
        let flags = if one_phase { Some(XaFlags::ONE_PHASE) } else { None };
        let result = match self.ctx.transport.get().commit_transaction(id, flags, Some(xid)) {
            Ok(_) => Ok(()),
            Err(e) if e.is_network() => self.check_xa_commit_status(id, xid, flags, e),
            Err(e) => Err(e),
        };
        // Settled either way: committed, or rolled back on the broker.
        self.ctx.xa_registry.remove(xid);
        self.ctx.unacked.clear();
        self.reset_state();
        result
    }

    fn check_xa_commit_status(
        &self,
        id: TransactionId,
        xid: &Xid,
        flags: Option<XaFlags>,
        cause: Error,
    ) -> Result<()> {
        info!(
            "[txn] session {} branch {xid} in doubt after commit failure ({cause}), verifying",
            self.session_id
        );
        if let Err(e) = self.ctx.recovery.wait_until_inactive() {
            warn!("[txn] session {} cannot verify branch {xid}: {e}", self.session_id);
            return Err(Error::TransactionRolledBack(format!(
                "branch {xid} rolled back: {cause}"
            )));
        }
        // A one-phase commit skips prepare; the last phase the client saw
        // succeed is the end.
        let last_phase = if flags == Some(XaFlags::ONE_PHASE) {
            TxnPhase::Ended
        } else {
            TxnPhase::Prepared
        };
        match self.ctx.transport.get().verify_transaction(id, last_phase) {
            Ok(VerifyOutcome::Committed) => {
                debug!("[txn] session {} branch {xid} committed before failure", self.session_id);
                Ok(())
            }
            Ok(VerifyOutcome::Prepared) => self
                .ctx
                .transport
                .get()
                .commit_transaction(id, flags, Some(xid))
                .map(|_| ())
                .map_err(|e| {
                    Error::TransactionRolledBack(format!("branch {xid} rolled back: {e}"))
                }),
            Ok(VerifyOutcome::RolledBack) => Err(Error::TransactionRolledBack(format!(
                "branch {xid} rolled back: {cause}"
            ))),
            Err(e) => Err(Error::TransactionRolledBack(format!(
                "branch {xid} rolled back: {e}"
            ))),
        }
    }

    /// In-doubt branches the broker still holds prepared, for a
    /// transaction manager's recovery scan.
    pub fn recover_xa(&self, flags: XaFlags) -> Result<Vec<Xid>> {
        self.ctx.transport.get().recover_xa(flags)
    }

    pub fn rollback_xa(&self, xid: &Xid) -> Result<()> {
        let id = self.xa_id(xid)?;
        let result = self.ctx.transport.get().rollback_transaction(id, Some(xid));
        self.ctx.xa_registry.remove(xid);
        self.ctx.unacked.clear();
        self.reset_state();
        result
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn active_id(&self) -> Result<TransactionId> {
        let id = self.transaction_id();
        if id < 0 {
            return Err(Error::IllegalState(format!(
                "session {} has no active transaction",
                self.session_id
            )));
        }
        Ok(id)
    }

    /// Resolve the broker id for `xid`, preferring this coordinator's
    /// cached branch and falling back to the registry for a branch another
    /// resource started.
    fn xa_id(&self, xid: &Xid) -> Result<TransactionId> {
        {
            let st = self.state.lock();
            if st.xid.as_ref() == Some(xid) && st.transaction_id >= 0 {
                return Ok(st.transaction_id);
            }
        }
        self.ctx
            .xa_registry
            .transaction_for(xid)
            .ok_or_else(|| Error::IllegalState(format!("unknown distributed branch {xid}")))
    }

    fn set_phase(&self, phase: TxnPhase) {
        self.state.lock().phase = phase;
    }

    /// Commit settled: clear the session's unacknowledged bookkeeping
    /// (exactly once per commit), stash the piggybacked next id, reopen.
    fn finish_success(&self, res: CommitResult) {
        self.ctx.unacked.clear();
        {
            let mut st = self.state.lock();
            *st = TxnState::default();
            st.next_id = res.next_transaction_id;
        }
        self.reopen_local();
    }

    /// The broker rolled the transaction back (or must be assumed to
    /// have). Discard bookkeeping, reopen, and report rollback upward.
    fn fail_rollback(&self, id: TransactionId, cause: Error) -> Result<()> {
        self.ctx.unacked.clear();
        self.reset_and_start_fresh();
        Err(Error::TransactionRolledBack(format!(
            "transaction {id} rolled back: {cause}"
        )))
    }

    fn reset_state(&self) {
        *self.state.lock() = TxnState::default();
    }

    fn reset_and_start_fresh(&self) {
        self.reset_state();
        self.reopen_local();
    }

    // The session stays usable whether or not this succeeds; a failure is
    // retried implicitly by the next explicit start.
    fn reopen_local(&self) {
        if let Err(e) = self.start_local() {
            warn!("[txn] session {} could not reopen a local transaction: {e}", self.session_id);
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("TransactionCoordinator")
            .field("session_id", &self.session_id)
            .field("transaction_id", &st.transaction_id)
            .field("phase", &st.phase)
            .finish()
    }
}
