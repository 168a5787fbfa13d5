// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Watermark eligibility properties of the flow controller.

mod common;

use std::sync::Arc;

use common::MockTransport;
use relaymq::{ClientConfig, FlowController, FlowEntry, FlowKey, Transport, TransportCell};

fn controller() -> Arc<FlowController> {
    let cfg = ClientConfig::default();
    let transport = MockTransport::new();
    FlowController::new(1, TransportCell::new(transport as Arc<dyn Transport>), &cfg)
}

#[test]
fn consumer_becomes_ready_exactly_at_the_water_mark() {
    let ctl = controller();
    ctl.register_consumer(1, 10); // water mark 5 at the default 50%
    let key = FlowKey::Consumer(1);

    ctl.request_resume(key);
    for _ in 0..6 {
        ctl.message_received(key);
    }
    assert!(ctl.ready_keys().is_empty(), "6 in flight is above the mark");

    ctl.message_delivered(key);
    assert_eq!(ctl.ready_keys(), vec![key], "5 in flight is at the mark");
}

#[test]
fn readiness_requires_a_pause_signal() {
    let ctl = controller();
    ctl.register_consumer(2, 10);
    let key = FlowKey::Consumer(2);

    ctl.message_received(key);
    ctl.message_delivered(key);
    assert!(ctl.ready_keys().is_empty(), "no resume requested, never ready");
}

#[test]
fn reset_never_drives_the_counter_negative() {
    let entry = FlowEntry::consumer(3, 10, 50);
    entry.message_received();
    entry.message_received();
    entry.reset(1_000_000);
    assert_eq!(entry.in_queue(), 0);

    // Further deliveries keep flooring at zero.
    entry.message_delivered();
    assert_eq!(entry.in_queue(), 0);
}

#[test]
fn reset_applies_even_when_entry_is_saturated() {
    let ctl = controller();
    ctl.register_consumer(4, 10);
    let key = FlowKey::Consumer(4);
    for _ in 0..10 {
        ctl.message_received(key);
    }
    ctl.request_resume(key);
    assert!(ctl.ready_keys().is_empty());

    // Session recover discards everything buffered; the freed capacity
    // must make the entry eligible.
    ctl.reset_flow(key, 10);
    assert_eq!(ctl.ready_keys(), vec![key]);
}

#[test]
fn connection_entry_uses_the_connection_watermark() {
    let cfg = ClientConfig {
        flow_water_mark: 2,
        ..ClientConfig::default()
    };
    let transport = MockTransport::new();
    let ctl = FlowController::new(2, TransportCell::new(transport as Arc<dyn Transport>), &cfg);

    let key = FlowKey::Connection;
    ctl.request_resume(key);
    for _ in 0..3 {
        ctl.message_received(key);
    }
    assert!(ctl.ready_keys().is_empty());
    ctl.message_delivered(key);
    assert_eq!(ctl.ready_keys(), vec![key]);
}
