// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! In-doubt commit resolution against a scripted broker.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use common::MockTransport;
use relaymq::txn::{TransactionCoordinator, TxnContext};
use relaymq::{
    Error, RecoveryCoordinator, Transport, TransportCell, UnackedStore, VerifyOutcome, XaRegistry,
};

fn coordinator(transport: &Arc<MockTransport>, is_ha: bool) -> TransactionCoordinator {
    let ctx = TxnContext {
        transport: TransportCell::new(Arc::clone(transport) as Arc<dyn Transport>),
        recovery: RecoveryCoordinator::new(1, Duration::from_millis(1), Some(3)),
        unacked: Arc::new(UnackedStore::default()),
        failover_occurred: Arc::new(AtomicBool::new(false)),
        xa_registry: Arc::new(XaRegistry::new()),
        is_ha,
    };
    TransactionCoordinator::new(1, ctx)
}

#[test]
fn prepared_verify_resolves_with_exactly_one_commit_resend() {
    let transport = MockTransport::new();
    transport.state.fail_op_times("commit_transaction", 1);
    *transport.state.verify_outcome.lock() = Some(VerifyOutcome::Prepared);

    let txn = coordinator(&transport, true);
    txn.start_local().expect("start");

    // Network dies on the commit phase; the broker still holds the
    // transaction prepared. No roll-back error may reach the caller.
    txn.commit().expect("verify path completes the commit");

    assert_eq!(transport.state.count("verify_transaction"), 1);
    assert_eq!(
        transport.state.count("commit_transaction"),
        2,
        "the failed attempt plus exactly one resend"
    );
}

#[test]
fn committed_verify_needs_no_resend() {
    let transport = MockTransport::new();
    transport.state.fail_op_times("commit_transaction", 1);
    *transport.state.verify_outcome.lock() = Some(VerifyOutcome::Committed);

    let txn = coordinator(&transport, true);
    txn.start_local().expect("start");
    txn.commit().expect("already committed broker-side");

    assert_eq!(transport.state.count("commit_transaction"), 1);
}

#[test]
fn failure_before_end_rolls_back_without_verify() {
    let transport = MockTransport::new();
    transport.state.fail_op("end_transaction");

    let txn = coordinator(&transport, true);
    txn.start_local().expect("start");

    let err = txn.commit().expect_err("assumed rolled back");
    assert!(matches!(err, Error::TransactionRolledBack(_)));
    assert_eq!(
        transport.state.count("verify_transaction"),
        0,
        "the broker never saw the transaction complete, nothing to verify"
    );
}

#[test]
fn verify_rolled_back_surfaces_rollback_and_reopens() {
    let transport = MockTransport::new();
    transport.state.fail_op_times("prepare_transaction", 1);
    *transport.state.verify_outcome.lock() = Some(VerifyOutcome::RolledBack);

    let txn = coordinator(&transport, true);
    txn.start_local().expect("start");

    let err = txn.commit().expect_err("broker rolled it back");
    assert!(matches!(err, Error::TransactionRolledBack(_)));
    // The session stays usable: a fresh local transaction was opened.
    assert!(txn.is_active());
}

#[test]
fn non_ha_commit_is_a_single_round_trip() {
    let transport = MockTransport::new();
    let txn = coordinator(&transport, false);
    txn.start_local().expect("start");
    txn.commit().expect("commit");

    assert_eq!(transport.state.count("commit_transaction"), 1);
    assert_eq!(transport.state.count("end_transaction"), 0);
    assert_eq!(transport.state.count("prepare_transaction"), 0);
}
