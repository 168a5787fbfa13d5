// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Connection read loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::delivery::DeliveryUnit;
use crate::error::Error;
use crate::transport::TransportCell;

/// How long a receive error pauses the loop before reloading the transport
/// slot (recovery swaps the replacement in behind our back).
const BROKEN_BACKOFF: Duration = Duration::from_millis(100);

/// Where the read channel hands inbound units. Implemented by the
/// connection hub.
pub trait InboundSink: Send + Sync {
    /// Route one unit: messages to their session queue, replies to their
    /// waiter, control units to the connection handler.
    fn route(&self, unit: DeliveryUnit);
    /// The transport reported a failure; the sink decides between recovery
    /// and fatal teardown.
    fn on_transport_broken(&self, err: &Error);
    fn is_closed(&self) -> bool;
}

/// One per connection: pulls units off the current transport and feeds the
/// sink until the connection closes.
pub struct ReadChannel {
    connection_id: u64,
    transport: TransportCell,
    sink: Arc<dyn InboundSink>,
    receive_timeout: Duration,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReadChannel {
    pub fn new(
        connection_id: u64,
        transport: TransportCell,
        sink: Arc<dyn InboundSink>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            connection_id,
            transport,
            sink,
            receive_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut slot = self.worker.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let transport = self.transport.clone();
        let sink = Arc::clone(&self.sink);
        let stop = Arc::clone(&self.stop);
        let timeout = self.receive_timeout;
        let connection_id = self.connection_id;
        let name = format!("relaymq-read-channel-{connection_id}");
        match thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(connection_id, transport, sink, stop, timeout))
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!("[channel] failed to spawn read channel {connection_id}: {e}"),
        }
    }

    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("[channel] read channel {} panicked during close", self.connection_id);
            }
        }
    }
}

fn run_loop(
    connection_id: u64,
    transport: TransportCell,
    sink: Arc<dyn InboundSink>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
) {
    debug!("[channel] read channel {connection_id} running");
    while !stop.load(Ordering::SeqCst) && !sink.is_closed() {
        match transport.get().receive_next(timeout) {
            Ok(Some(unit)) => sink.route(unit),
            Ok(None) => {}
            Err(e) => {
                if stop.load(Ordering::SeqCst) || sink.is_closed() {
                    break;
                }
                sink.on_transport_broken(&e);
                // Recovery replaces the transport in the shared slot; the
                // next load picks it up.
                thread::sleep(BROKEN_BACKOFF);
            }
        }
    }
    debug!("[channel] read channel {connection_id} stopped");
}

impl std::fmt::Debug for ReadChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadChannel")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubTransport;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct RecordingSink {
        routed: PlMutex<Vec<u8>>,
        broken_reports: AtomicU32,
        closed: AtomicBool,
    }

    impl InboundSink for RecordingSink {
        fn route(&self, unit: DeliveryUnit) {
            self.routed.lock().push(unit.body[0]);
        }
        fn on_transport_broken(&self, _err: &Error) {
            self.broken_reports.fetch_add(1, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn routes_inbound_units_in_order() {
        let stub = Arc::new(StubTransport::default());
        stub.push_inbound(DeliveryUnit::message(1, 5, vec![1]));
        stub.push_inbound(DeliveryUnit::message(1, 5, vec![2]));
        let sink = Arc::new(RecordingSink::default());
        let channel = ReadChannel::new(
            1,
            TransportCell::new(Arc::clone(&stub) as Arc<dyn crate::transport::Transport>),
            Arc::clone(&sink) as Arc<dyn InboundSink>,
            Duration::from_millis(5),
        );
        channel.start();
        thread::sleep(Duration::from_millis(60));
        channel.close();
        assert_eq!(*sink.routed.lock(), vec![1, 2]);
    }

    #[test]
    fn reports_breakage_and_survives_transport_swap() {
        let stub = Arc::new(StubTransport::default());
        stub.broken.store(true, Ordering::SeqCst);
        let cell = TransportCell::new(Arc::clone(&stub) as Arc<dyn crate::transport::Transport>);
        let sink = Arc::new(RecordingSink::default());
        let channel = ReadChannel::new(
            2,
            cell.clone(),
            Arc::clone(&sink) as Arc<dyn InboundSink>,
            Duration::from_millis(5),
        );
        channel.start();
        thread::sleep(Duration::from_millis(150));
        assert!(sink.broken_reports.load(Ordering::SeqCst) >= 1);

        // Swap in a healthy replacement; routing resumes.
        let fresh = Arc::new(StubTransport::default());
        fresh.push_inbound(DeliveryUnit::message(1, 5, vec![9]));
        cell.swap(fresh as Arc<dyn crate::transport::Transport>);
        thread::sleep(Duration::from_millis(200));
        channel.close();
        assert_eq!(*sink.routed.lock(), vec![9]);
    }
}
