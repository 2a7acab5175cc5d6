//! # Node Errors
//!
//! | Variant | Raised by | Policy |
//! |---------|-----------|--------|
//! | `Configuration` | config load, mapper construction | fatal before connecting |
//! | `TransportUnavailable` | pool open / borrow | fatal at startup, returned afterwards |
//! | `PoolExhausted`, `PoolClosed` | pool borrow | returned to caller |
//! | `Serialization` | envelope encode/decode | returned, or logged and dropped in dispatch |
//! | `Timeout` | `call_method` | distinguished, matchable outcome |
//! | `Transport` | publish / request | returned to caller |
//! | `Subscribe`, `HandlerStart`, `AlreadyStarted` | lifecycle | fatal at startup |
//!
//! Application-level failures never appear here: they travel inside
//! `Response::errors`.

use cube_bus::BusError;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the node substrate.
#[derive(Debug, Error)]
pub enum CubeError {
    /// Missing or invalid startup configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The pool could not obtain a connection to the bus.
    #[error("bus transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Every pooled connection stayed leased for the whole borrow timeout.
    #[error("connection pool exhausted (waited {0:?})")]
    PoolExhausted(Duration),

    /// The pool has been drained and accepts no more borrows.
    #[error("connection pool closed")]
    PoolClosed,

    /// Envelope encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No reply arrived before the `call_method` deadline.
    #[error("cube: request timeout")]
    Timeout,

    /// Publish or request failed at the transport.
    #[error("transport error: {0}")]
    Transport(#[source] BusError),

    /// A dispatcher could not subscribe to its channel.
    #[error("cannot subscribe to {subject}: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BusError,
    },

    /// The handler's start callback failed.
    #[error("can't start instance: {0}")]
    HandlerStart(String),

    /// `start` was called on a node that already left the constructed state.
    #[error("node already started")]
    AlreadyStarted,
}

impl CubeError {
    /// True for the distinguished "no reply before deadline" outcome.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CubeError::Timeout)
    }
}

impl From<BusError> for CubeError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Timeout => CubeError::Timeout,
            BusError::Connect { .. } => CubeError::TransportUnavailable(e.to_string()),
            other => CubeError::Transport(other),
        }
    }
}

/// Result type for node operations.
pub type CubeResult<T> = Result<T, CubeError>;
