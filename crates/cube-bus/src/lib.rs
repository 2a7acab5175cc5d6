//! # Cube Bus - Transport Layer for Cube Nodes
//!
//! The bus is the only way cube nodes talk to each other. This crate defines
//! the transport seam the node substrate is written against, plus two
//! implementations of it.
//!
//! ## Capabilities
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | `publish` | Fire-and-forget delivery to every matching subscriber |
//! | `subscribe` | Broadcast subscription, or queue-group when a group is given |
//! | `request` | Publish with an ephemeral reply subject, wait for one reply |
//!
//! ```text
//! ┌──────────────┐   publish / request    ┌──────────────┐
//! │    Node A    │ ─────────────────────→ │   Bus        │
//! │              │ ←───────────────────── │  (NATS or    │
//! └──────────────┘      reply subject     │  in-memory)  │
//!                                         └──────┬───────┘
//!                                                │ subscribe
//!                                         ┌──────┴───────┐
//!                                         │    Node B    │
//!                                         └──────────────┘
//! ```
//!
//! ## Implementations
//!
//! - [`InMemoryBus`]: single-process bus, used by tests and embedded setups.
//! - [`NatsConnector`]: speaks the NATS text protocol over TCP.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod connection;
pub mod error;
pub mod memory;
pub mod nats;
pub mod subject;

// Re-export main types
pub use connection::{BusConnection, BusConnector, BusSubscription, Delivery};
pub use error::BusError;
pub use memory::InMemoryBus;
pub use nats::NatsConnector;
pub use subject::{new_inbox, subject_matches, INBOX_PREFIX};

/// Default bus port used when a deployment does not specify one.
pub const DEFAULT_BUS_PORT: u16 = 4444;

/// Default bus host used when a deployment does not specify one.
pub const DEFAULT_BUS_HOST: &str = "cubes-bus";
