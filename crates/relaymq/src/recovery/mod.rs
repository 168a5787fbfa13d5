// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Connection failover orchestration.
//!
//! When the transport reports brokenness the connection hands a
//! [`RecoveryTarget`] to the [`RecoveryCoordinator`], which runs the rebuild
//! sequence on a dedicated worker: reconnect the transport, quiesce and
//! reset sessions, re-handshake, re-register sessions/consumers/producers,
//! resume delivery. Observers (notably in-doubt transactions) block on
//! [`RecoveryCoordinator::wait_until_inactive`] until the machine settles.
//!
//! State machine:
//! `Inactive -> Started -> InProcess -> TransportConnected -> Succeeded |
//! Failed -> Inactive`, with a sticky `Aborted` terminal once the retry
//! budget is spent. `Started` is set before the worker is spawned so a
//! waiter can never observe a stale `Inactive` between a start request and
//! the worker running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Poll interval for [`RecoveryCoordinator::wait_until_inactive`].
const WAIT_TIME: Duration = Duration::from_secs(3);
/// Log the observed state every this many polls.
const LOG_EVERY: u32 = 5;
/// Give up waiting after this many polls (10 minutes at `WAIT_TIME`).
const MAX_WAIT_COUNT: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Inactive,
    Started,
    InProcess,
    /// Transient: the replacement transport is up, rebuild still running.
    TransportConnected,
    Succeeded,
    Failed,
    /// Sticky terminal: retry budget exhausted.
    Aborted,
}

impl RecoveryState {
    /// The transient set observers must wait out.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            RecoveryState::Started | RecoveryState::InProcess | RecoveryState::TransportConnected
        )
    }
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryState::Inactive => "INACTIVE",
            RecoveryState::Started => "STARTED",
            RecoveryState::InProcess => "IN_PROCESS",
            RecoveryState::TransportConnected => "TRANSPORT_CONNECTED",
            RecoveryState::Succeeded => "SUCCEEDED",
            RecoveryState::Failed => "FAILED",
            RecoveryState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// The connection-side rebuild steps, in the order the worker runs them.
/// Each step takes and releases its own locks; the coordinator holds none
/// across steps so close and other operations can interleave.
pub trait RecoveryTarget: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Close the broken transport and install a replacement.
    fn reconnect_transport(&self) -> Result<()>;
    /// Mark connection-consumers failing-over and clear their queues.
    fn prepare_failover(&self);
    /// Reset every session: clear unacknowledged state, discard buffered
    /// units referencing the old transport. May reject recovery outright.
    fn reset_sessions(&self) -> Result<()>;
    /// Repeat the protocol handshake on the new transport.
    fn handshake(&self) -> Result<()>;
    fn rebuild_sessions(&self) -> Result<()>;
    /// Re-register every open consumer, pruning those that closed during
    /// the race.
    fn rebuild_consumers(&self) -> Result<()>;
    /// Release the failing-over mark set by `prepare_failover`.
    fn release_failover(&self);
    fn rebuild_producers(&self) -> Result<()>;
    /// Restart broker delivery if the connection was in started state.
    fn resume_delivery(&self) -> Result<()>;

    /// Recovery completed; the connection is live again.
    fn on_recovered(&self);
    /// One attempt failed; the worker will retry while budget remains.
    fn on_attempt_failed(&self, _err: &Error) {}
    /// Retry budget spent; the connection is permanently dead.
    fn on_aborted(&self, err: &Error);
}

#[derive(Debug)]
struct Inner {
    state: RecoveryState,
    failed_count: u32,
    attempt: u64,
}

/// Per-connection recovery state machine.
pub struct RecoveryCoordinator {
    connection_id: u64,
    recover_delay: Duration,
    max_retries: Option<u32>,
    inner: Mutex<Inner>,
    cond: Condvar,
    closed: AtomicBool,
}

impl RecoveryCoordinator {
    pub fn new(connection_id: u64, recover_delay: Duration, max_retries: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            connection_id,
            recover_delay,
            max_retries,
            inner: Mutex::new(Inner {
                state: RecoveryState::Inactive,
                failed_count: 0,
                attempt: 0,
            }),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> RecoveryState {
        self.inner.lock().state
    }

    pub fn is_recovering(&self) -> bool {
        self.state().is_transient()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == RecoveryState::Aborted
    }

    /// Begin recovery. Returns whether a worker was launched; a no-op while
    /// a worker is already running or after abort. The state moves to
    /// `Started` before the worker thread exists.
    pub fn start(self: &Arc<Self>, target: Arc<dyn RecoveryTarget>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let attempt = {
            let mut inner = self.inner.lock();
            if inner.state.is_transient() {
                debug!(
                    "[recovery] start ignored, already {} (connection {})",
                    inner.state, self.connection_id
                );
                return false;
            }
            if inner.state == RecoveryState::Aborted {
                return false;
            }
            inner.state = RecoveryState::Started;
            inner.attempt += 1;
            inner.attempt
        };
        self.cond.notify_all();

        let coord = Arc::clone(self);
        let name = format!("relaymq-recovery-{}-{attempt}", self.connection_id);
        if let Err(e) = thread::Builder::new().name(name).spawn(move || coord.run(target)) {
            error!("[recovery] failed to spawn worker: {e}");
            self.set_state(RecoveryState::Inactive);
            return false;
        }
        true
    }

    /// Permanently stop the coordinator; wakes the worker and all waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Block until the machine leaves the transient set. Logs the state
    /// every few polls; gives up after a bounded total wait or when the
    /// owning connection closes.
    pub fn wait_until_inactive(&self) -> Result<()> {
        let mut polls = 0u32;
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                RecoveryState::Aborted => return Err(Error::RecoveryAborted),
                s if !s.is_transient() => return Ok(()),
                _ => {}
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if polls >= MAX_WAIT_COUNT {
                return Err(Error::IllegalState(format!(
                    "recovery still {} after {polls} polls",
                    inner.state
                )));
            }
            polls += 1;
            if polls % LOG_EVERY == 0 {
                info!(
                    "[recovery] waiting for connection {} to settle, state {} (poll {polls})",
                    self.connection_id, inner.state
                );
            }
            self.cond.wait_for(&mut inner, WAIT_TIME);
        }
    }

    fn set_state(&self, state: RecoveryState) {
        let mut inner = self.inner.lock();
        // Aborted is terminal.
        if inner.state != RecoveryState::Aborted {
            inner.state = state;
        }
        drop(inner);
        self.cond.notify_all();
    }

    // ========================================================================
    // Worker
    // ========================================================================

    fn run(self: Arc<Self>, target: Arc<dyn RecoveryTarget>) {
        loop {
            if self.closed.load(Ordering::SeqCst) || target.is_closed() {
                debug!("[recovery] connection {} closed, worker exiting", self.connection_id);
                self.set_state(RecoveryState::Inactive);
                return;
            }
            self.set_state(RecoveryState::InProcess);
            info!("[recovery] connection {} recovery in process", self.connection_id);

            // HA brokers need time to elect the takeover peer.
            thread::sleep(self.recover_delay);

            match self.run_sequence(&target) {
                Ok(()) => {
                    self.set_state(RecoveryState::Succeeded);
                    self.inner.lock().failed_count = 0;
                    self.set_state(RecoveryState::Inactive);
                    info!("[recovery] connection {} recovered", self.connection_id);
                    target.on_recovered();
                    return;
                }
                Err(Error::Closed) => {
                    self.set_state(RecoveryState::Inactive);
                    return;
                }
                Err(e) => {
                    warn!("[recovery] connection {} attempt failed: {e}", self.connection_id);
                    self.set_state(RecoveryState::Failed);
                    target.on_attempt_failed(&e);
                    let failed = {
                        let mut inner = self.inner.lock();
                        inner.failed_count += 1;
                        inner.failed_count
                    };
                    if let Some(max) = self.max_retries {
                        if failed > max {
                            error!(
                                "[recovery] connection {} gave up after {failed} failures",
                                self.connection_id
                            );
                            self.set_state(RecoveryState::Aborted);
                            target.on_aborted(&e);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn run_sequence(&self, target: &Arc<dyn RecoveryTarget>) -> Result<()> {
        self.checkpoint(target)?;
        target.reconnect_transport()?;
        self.set_state(RecoveryState::TransportConnected);
        debug!("[recovery] connection {} transport reconnected", self.connection_id);

        self.checkpoint(target)?;
        target.prepare_failover();
        target.reset_sessions()?;

        self.checkpoint(target)?;
        target.handshake()?;
        target.rebuild_sessions()?;
        target.rebuild_consumers()?;
        target.release_failover();
        target.rebuild_producers()?;

        self.checkpoint(target)?;
        target.resume_delivery()
    }

    // Step boundary: bail out promptly once the connection closes.
    fn checkpoint(&self, target: &Arc<dyn RecoveryTarget>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || target.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingTarget {
        sequences: AtomicU32,
        fail_first: AtomicU32,
        aborted: AtomicBool,
        recovered: AtomicBool,
    }

    impl RecoveryTarget for CountingTarget {
        fn is_closed(&self) -> bool {
            false
        }
        fn reconnect_transport(&self) -> Result<()> {
            self.sequences.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::ConnectionBroken("still down".into()));
            }
            Ok(())
        }
        fn prepare_failover(&self) {}
        fn reset_sessions(&self) -> Result<()> {
            Ok(())
        }
        fn handshake(&self) -> Result<()> {
            Ok(())
        }
        fn rebuild_sessions(&self) -> Result<()> {
            Ok(())
        }
        fn rebuild_consumers(&self) -> Result<()> {
            Ok(())
        }
        fn release_failover(&self) {}
        fn rebuild_producers(&self) -> Result<()> {
            Ok(())
        }
        fn resume_delivery(&self) -> Result<()> {
            Ok(())
        }
        fn on_recovered(&self) {
            self.recovered.store(true, Ordering::SeqCst);
        }
        fn on_aborted(&self, _err: &Error) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn coordinator(max_retries: Option<u32>) -> Arc<RecoveryCoordinator> {
        RecoveryCoordinator::new(9, Duration::from_millis(1), max_retries)
    }

    #[test]
    fn double_start_runs_one_worker() {
        let coord = coordinator(Some(3));
        let target = Arc::new(CountingTarget::default());
        coord.start(Arc::clone(&target) as Arc<dyn RecoveryTarget>);
        coord.start(Arc::clone(&target) as Arc<dyn RecoveryTarget>);
        coord.wait_until_inactive().expect("recovery settles");
        assert_eq!(target.sequences.load(Ordering::SeqCst), 1);
        assert!(target.recovered.load(Ordering::SeqCst));
    }

    #[test]
    fn retries_until_success() {
        let coord = coordinator(Some(10));
        let target = Arc::new(CountingTarget::default());
        target.fail_first.store(2, Ordering::SeqCst);
        coord.start(Arc::clone(&target) as Arc<dyn RecoveryTarget>);
        coord.wait_until_inactive().expect("recovery settles");
        assert_eq!(target.sequences.load(Ordering::SeqCst), 3);
        assert!(target.recovered.load(Ordering::SeqCst));
        assert!(!target.aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn budget_exhaustion_aborts_permanently() {
        let coord = coordinator(Some(1));
        let target = Arc::new(CountingTarget::default());
        target.fail_first.store(100, Ordering::SeqCst);
        coord.start(Arc::clone(&target) as Arc<dyn RecoveryTarget>);
        let err = coord.wait_until_inactive().expect_err("aborts");
        assert!(matches!(err, Error::RecoveryAborted));
        assert!(target.aborted.load(Ordering::SeqCst));
        assert!(coord.is_aborted());

        // Sticky: further starts are refused.
        coord.start(target as Arc<dyn RecoveryTarget>);
        assert!(coord.is_aborted());
    }

    #[test]
    fn waiter_never_observes_stale_inactive() {
        let coord = coordinator(Some(3));
        let target = Arc::new(CountingTarget::default());
        coord.start(Arc::clone(&target) as Arc<dyn RecoveryTarget>);
        // State is Started or later the instant start() returns.
        assert_ne!(coord.state(), RecoveryState::Inactive);
        coord.wait_until_inactive().expect("settles");
    }
}
