// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Synchronous broker round trips.
//!
//! Every request expecting a reply parks on its own [`AckWaiter`]; the read
//! channel routes the correlated reply into it. The wait is diagnostic-heavy
//! rather than trigger-happy: it logs on a doubling interval, dumps state
//! once after repeated silence, and aborts only on caller timeout, close, or
//! a broken/recovering connection. Retransmission on silence is policy-gated
//! by [`RequestKind::is_resendable`](crate::transport::RequestKind) and HA
//! connectivity.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{error, warn};
use parking_lot::{Condvar, Mutex};

use crate::delivery::DeliveryUnit;
use crate::error::{Error, Result};
use crate::transport::Request;

/// First "still waiting" diagnostic fires after this long without a reply
/// (or after the caller's full timeout, if shorter).
const INITIAL_LOG_INTERVAL: Duration = Duration::from_secs(120);
/// Verbose state dump after this many silent log intervals.
const DUMP_AFTER_ITERATIONS: u32 = 3;

/// Connection-side services the waiter needs while parked.
pub trait AckContext {
    /// Link failed with no recovery possible for this request.
    fn is_broken(&self) -> bool;
    /// Recovery is rebuilding the connection; the pending reply will never
    /// arrive on the old transport.
    fn is_recovering(&self) -> bool;
    /// Connected to an HA broker pair (enables the resend policy).
    fn is_ha(&self) -> bool;
    /// Retransmit the original request on the current transport.
    fn resend(&self, request: &Request) -> Result<()>;
    /// One-shot verbose connection/request state for the silence dump.
    fn dump_state(&self) -> String;
}

#[derive(Debug, Default)]
struct WaiterState {
    replies: VecDeque<DeliveryUnit>,
    closed: bool,
}

/// Single-request reply mailbox with a monitored wait.
#[derive(Debug, Default)]
pub struct AckWaiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl AckWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a correlated reply and wake the waiter.
    pub fn on_reply(&self, unit: DeliveryUnit) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.replies.push_back(unit);
        drop(st);
        self.cond.notify_all();
    }

    /// Permanently release the waiter with no reply.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        drop(st);
        self.cond.notify_all();
    }

    /// Block until the reply for `request` arrives. A zero `timeout` waits
    /// forever (diagnostics still fire on the backoff schedule).
    pub fn await_reply(
        &self,
        ctx: &dyn AckContext,
        request: &Request,
        timeout: Duration,
    ) -> Result<DeliveryUnit> {
        let started = Instant::now();
        let unbounded = timeout.is_zero();
        let mut interval = if unbounded || timeout > INITIAL_LOG_INTERVAL {
            INITIAL_LOG_INTERVAL
        } else {
            timeout
        };
        let mut iterations = 0u32;
        let mut dumped = false;

        let mut st = self.state.lock();
        loop {
            if let Some(unit) = st.replies.pop_front() {
                return Ok(unit);
            }
            if st.closed {
                return Err(Error::ConnectionBroken(format!(
                    "connection closed while awaiting {} reply",
                    request.kind.name()
                )));
            }
            if ctx.is_broken() || ctx.is_recovering() {
                return Err(Error::ConnectionBroken(format!(
                    "connection unavailable while awaiting {} reply",
                    request.kind.name()
                )));
            }
            if !unbounded {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(Error::AckTimeout(format!(
                        "no {} reply within {:?}",
                        request.kind.name(),
                        timeout
                    )));
                }
                interval = interval.min(timeout - elapsed);
            }

            // A wakeup with the queue still empty before the interval is up
            // is spurious; keep waiting out the remainder.
            let interval_deadline = Instant::now() + interval;
            loop {
                let now = Instant::now();
                if now >= interval_deadline {
                    break;
                }
                self.cond.wait_for(&mut st, interval_deadline - now);
                if !st.replies.is_empty() || st.closed {
                    break;
                }
            }
            if !st.replies.is_empty() || st.closed {
                continue;
            }

            iterations += 1;
            warn!(
                "[ack] still waiting for {} reply after {:?} (iteration {iterations})",
                request.kind.name(),
                started.elapsed()
            );
            if iterations >= DUMP_AFTER_ITERATIONS && !dumped {
                dumped = true;
                error!("[ack] reply overdue, state dump: {}", ctx.dump_state());
            }
            if ctx.is_ha() && request.kind.is_resendable() {
                // The waiter keeps the same correlation; a duplicate reply
                // from the first send is simply consumed.
                drop(st);
                if let Err(e) = ctx.resend(request) {
                    warn!("[ack] resend of {} failed: {e}", request.kind.name());
                }
                st = self.state.lock();
            }
            interval = interval.saturating_mul(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RequestKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct StubCtx {
        broken: std::sync::atomic::AtomicBool,
        ha: bool,
        resends: AtomicU32,
    }

    impl AckContext for StubCtx {
        fn is_broken(&self) -> bool {
            self.broken.load(Ordering::SeqCst)
        }
        fn is_recovering(&self) -> bool {
            false
        }
        fn is_ha(&self) -> bool {
            self.ha
        }
        fn resend(&self, _request: &Request) -> Result<()> {
            self.resends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn dump_state(&self) -> String {
            "stub".into()
        }
    }

    #[test]
    fn reply_releases_waiter() {
        let waiter = Arc::new(AckWaiter::new());
        let handle = {
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || {
                let ctx = StubCtx::default();
                let req = Request::control(RequestKind::Ping);
                waiter.await_reply(&ctx, &req, Duration::from_secs(5))
            })
        };
        thread::sleep(Duration::from_millis(20));
        waiter.on_reply(DeliveryUnit::reply(1, vec![0xAA]));
        let unit = handle.join().expect("waiter thread").expect("reply");
        assert_eq!(unit.body, vec![0xAA]);
    }

    #[test]
    fn timeout_yields_ack_timeout() {
        let waiter = AckWaiter::new();
        let ctx = StubCtx::default();
        let req = Request::control(RequestKind::Acknowledge);
        let err = waiter
            .await_reply(&ctx, &req, Duration::from_millis(40))
            .expect_err("must time out");
        assert!(matches!(err, Error::AckTimeout(_)));
    }

    #[test]
    fn close_releases_with_broken_error() {
        let waiter = Arc::new(AckWaiter::new());
        let handle = {
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || {
                let ctx = StubCtx::default();
                let req = Request::control(RequestKind::Acknowledge);
                waiter.await_reply(&ctx, &req, Duration::ZERO)
            })
        };
        thread::sleep(Duration::from_millis(20));
        waiter.close();
        let err = handle.join().expect("waiter thread").expect_err("closed");
        assert!(matches!(err, Error::ConnectionBroken(_)));
        // Replies after close are dropped.
        waiter.on_reply(DeliveryUnit::reply(1, vec![]));
        assert!(waiter.state.lock().replies.is_empty());
    }

    #[test]
    fn broken_connection_aborts_wait() {
        let waiter = AckWaiter::new();
        let ctx = StubCtx::default();
        ctx.broken.store(true, Ordering::SeqCst);
        let req = Request::control(RequestKind::Ping);
        let err = waiter
            .await_reply(&ctx, &req, Duration::from_secs(5))
            .expect_err("broken");
        assert!(matches!(err, Error::ConnectionBroken(_)));
    }
}
