// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! # RelayMQ client engine
//!
//! The client-side core of the RelayMQ message-broker protocol: it delivers
//! broker-originated messages to application consumers, paces traffic
//! against broker-advertised capacity, and keeps a logical connection alive
//! and transactionally consistent across broker failover.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaymq::{ClientConfig, ConnectionCore, ConsumerSpec};
//! # fn open_transport() -> Arc<dyn relaymq::Transport> { unimplemented!() }
//! # fn open_codec() -> Arc<dyn relaymq::Codec> { unimplemented!() }
//!
//! fn main() -> relaymq::Result<()> {
//!     let connection = ConnectionCore::connect(
//!         1,
//!         open_transport(),
//!         open_codec(),
//!         ClientConfig::default(),
//!     )?;
//!     let session = connection.create_session(false)?;
//!     connection.add_consumer(
//!         &session,
//!         ConsumerSpec {
//!             destination: "orders".into(),
//!             selector: None,
//!             durable_name: None,
//!         },
//!         100,
//!         Box::new(|message| {
//!             println!("got message {}", message.message_id);
//!             Ok(())
//!         }),
//!     )?;
//!     connection.start()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Application threads                      |
//! |      publish / acknowledge / commit / rollback / receive     |
//! +--------------------------------------------------------------+
//! |  ConnectionCore                                              |
//! |    ReadChannel -> DeliveryQueue -> SessionReader -> callback |
//! |    FlowController (watermarks, resume grants, keep-alive)    |
//! |    RecoveryCoordinator (failover rebuild state machine)      |
//! |    TransactionCoordinator (local / HA three-phase / XA)      |
//! +--------------------------------------------------------------+
//! |  Transport + Codec (wire protocol, supplied by the caller)   |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionCore`] | One logical broker connection and everything it owns |
//! | [`Session`] | Serialization scope for consuming, producing and transacting |
//! | [`DeliveryQueue`] | Priority-ordered blocking buffer feeding each reader |
//! | [`FlowController`] | Watermark tracking and broker resume grants |
//! | [`RecoveryCoordinator`] | Failover reconnect and rebuild state machine |
//! | [`TransactionCoordinator`] | Local, HA three-phase, and XA transactions |
//!
//! The wire protocol itself is not in scope: callers supply a [`Transport`]
//! that moves opaque units and a [`Codec`] that decodes message bodies.

pub mod ack;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod flow;
pub mod reader;
pub mod recovery;
pub mod session;
pub mod transport;
pub mod txn;

#[cfg(test)]
pub(crate) mod testing;

pub use ack::{AckContext, AckWaiter};
pub use config::ClientConfig;
pub use connection::{ConnectionCore, ConnectionSignals, RecoveryEvent, RecoveryListener};
pub use consumer::{ConnectionConsumer, ConsumerHandle, MessageCallback};
pub use delivery::{DeliveryQueue, DeliveryUnit, UnitKind, PRIORITY_LEVELS};
pub use error::{Error, Result};
pub use flow::{FlowController, FlowEntry, FlowKey};
pub use reader::{InboundSink, ReadChannel, ReaderEvents, SessionReader};
pub use recovery::{RecoveryCoordinator, RecoveryState, RecoveryTarget};
pub use session::{Session, SessionContext, UnackedStore};
pub use transport::{
    Codec, CommitResult, ConsumerId, ConsumerSpec, CorrelationId, InboundMessage, ProducerSpec,
    Request, RequestKind, TransactionId, Transport, TransportCell, VerifyOutcome,
};
pub use txn::{TransactionCoordinator, TxnPhase, XaFlags, XaRegistry, Xid};
