//! # Cube HTTP Gateway
//!
//! A cube that adapts HTTP to the bus. Each HTTP request becomes a node
//! request on a channel chosen by URI (or by HTTP method when no routing
//! table is configured); the reply is translated back into an HTTP response.
//!
//! ## Status mapping
//!
//! | Situation | Status |
//! |-----------|--------|
//! | bad token, or anonymous while only authorized requests are served | 401 |
//! | URI missing from the routing table | 400 |
//! | no reply within the timeout | 504 |
//! | reply `result` `{status, body}` | `status` |
//! | reply with errors only | first error code, or 500 |
//! | empty reply | 204 |
//! | anything else | 500 |

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod auth;
pub mod cli;
pub mod error;
pub mod handler;
pub mod payload;
pub mod server;
pub mod settings;

// Re-export main types
pub use auth::{AuthError, Claims, Identity, JwtVerifier};
pub use cli::GatewayCli;
pub use error::GatewayError;
pub use handler::GatewayHandler;
pub use payload::{Body, HttpReply, RequestParams};
pub use server::{build_router, serve};
pub use settings::{parse_endpoints_map, GatewaySettings};
