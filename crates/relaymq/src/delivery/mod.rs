// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Inbound delivery buffering.
//!
//! A [`DeliveryQueue`] sits between the connection's read channel and each
//! session's reader thread: the read channel enqueues [`DeliveryUnit`]s as
//! they arrive off the wire, the reader blocks on `dequeue_wait` and feeds
//! consumer callbacks. Priority order is total within one queue; FIFO within
//! a priority.

mod queue;
mod unit;

pub use queue::DeliveryQueue;
pub use unit::{DeliveryUnit, UnitKind, PRIORITY_LEVELS};
