// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! One inbound protocol unit awaiting dispatch.

/// Number of distinct priority levels (0-9, higher = more urgent).
pub const PRIORITY_LEVELS: usize = 10;

/// How the read channel routes a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Broker-originated message destined for a consumer callback.
    Message,
    /// Reply to an outstanding correlated request.
    Reply,
    /// Broker control signal with no consumer destination.
    Control,
}

/// An opaque inbound protocol unit.
///
/// Owned exclusively by the [`DeliveryQueue`](super::DeliveryQueue) it is
/// enqueued on until dequeued; ownership then transfers to the reader.
#[derive(Debug, Clone)]
pub struct DeliveryUnit {
    /// Routing discriminator.
    pub kind: UnitKind,
    /// For messages: the target consumer. For replies: the correlation id
    /// of the request being answered.
    pub consumer_id: u64,
    /// Delivery priority, clamped to 0-9.
    pub priority: u8,
    /// Broker marker: this unit drains the consumer's current grant; the
    /// broker pauses consumer-scoped delivery until a resume is requested.
    pub last_in_batch: bool,
    /// Broker marker: connection-scoped delivery is paused until a resume
    /// is requested.
    pub flow_paused: bool,
    /// Opaque body; decoded by the [`Codec`](crate::transport::Codec).
    pub body: Vec<u8>,
}

impl DeliveryUnit {
    /// A message unit bound for `consumer_id`.
    pub fn message(consumer_id: u64, priority: u8, body: Vec<u8>) -> Self {
        Self {
            kind: UnitKind::Message,
            consumer_id,
            priority: priority.min(PRIORITY_LEVELS as u8 - 1),
            last_in_batch: false,
            flow_paused: false,
            body,
        }
    }

    /// A reply unit answering the request with the given correlation id.
    pub fn reply(correlation: u64, body: Vec<u8>) -> Self {
        Self {
            kind: UnitKind::Reply,
            consumer_id: correlation,
            priority: PRIORITY_LEVELS as u8 - 1,
            last_in_batch: false,
            flow_paused: false,
            body,
        }
    }

    /// A broker control unit (no consumer destination).
    pub fn control(body: Vec<u8>) -> Self {
        Self {
            kind: UnitKind::Control,
            consumer_id: 0,
            priority: PRIORITY_LEVELS as u8 - 1,
            last_in_batch: false,
            flow_paused: false,
            body,
        }
    }

    /// Mark this unit as the last of the consumer's current grant.
    pub fn with_last_in_batch(mut self) -> Self {
        self.last_in_batch = true;
        self
    }

    /// Mark this unit as carrying the connection-scoped pause signal.
    pub fn with_flow_paused(mut self) -> Self {
        self.flow_paused = true;
        self
    }
}
