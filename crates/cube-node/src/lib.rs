//! # Cube Node - Pub/Sub Microservice Substrate
//!
//! A cube is a process that talks to the world only through the bus. It
//! declares the logical channels it listens on, implements a handful of
//! callbacks, and lets the substrate handle the rest.
//!
//! ## Architecture
//!
//! ```text
//!            ┌─────────────────── Cube ───────────────────┐
//!            │                                            │
//!  bus ────→ │ Dispatcher (per channel) ──→ Handler       │
//!            │        │                        │          │
//!            │        └── reply ──┐            │ Node     │
//!            │                    ▼            ▼          │
//!  bus ←──── │            RpcClient ←── publish/call/log  │
//!            │                │                           │
//!            │          ChannelMapper + ConnectionPool    │
//!            └────────────────────────────────────────────┘
//! ```
//!
//! ## Request/Reply
//!
//! `call_method` publishes a [`Request`] with an ephemeral reply subject and
//! waits a bounded time. No reply means [`CubeError::Timeout`]; there is no
//! retry. On the receiving side every request gets exactly one [`Response`],
//! even when the handler fails.
//!
//! ## Logging
//!
//! `Node::log` publishes records on `log.<level>.<class>.<instanceId>` and
//! mirrors them to `tracing`.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod channel;
pub mod config;
pub mod cube;
mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod logger;
pub mod pool;
pub mod rpc;

// Re-export main types
pub use channel::{BusSubject, Channel, ChannelMapper};
pub use config::NodeConfig;
pub use cube::Cube;
pub use envelope::{Message, Request, Response, ResponseError, ENVELOPE_VERSION};
pub use error::{CubeError, CubeResult};
pub use handler::{Handler, Node};
pub use lifecycle::{termination_signal, LifecycleState};
pub use logger::{log_subject, LogEmitter, LogLevel, LogRecord};
pub use pool::{ConnectionPool, PooledConnection};
pub use rpc::RpcClient;
