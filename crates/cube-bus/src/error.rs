//! Bus transport errors.

use thiserror::Error;

/// Errors raised by a bus connection.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus endpoint could not be reached.
    #[error("cannot connect to bus at {address}: {reason}")]
    Connect { address: String, reason: String },

    /// No reply arrived before the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The connection has been closed locally or by the server.
    #[error("connection closed")]
    Closed,

    /// The server sent something we could not parse, or rejected a command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload larger than the server's `max_payload`.
    #[error("payload of {size} bytes exceeds server limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Too much outgoing data queued while the connection is down.
    #[error("outgoing buffer full ({limit} bytes pending)")]
    BufferFull { limit: usize },

    /// The subject is empty or contains whitespace.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Socket level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// True when the error means "no reply before the deadline".
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_timeout() {
        assert!(BusError::Timeout.is_timeout());
        assert!(!BusError::Closed.is_timeout());
    }

    #[test]
    fn test_connect_display() {
        let err = BusError::Connect {
            address: "nats://cubes-bus:4444".into(),
            reason: "refused".into(),
        };
        assert!(err.to_string().contains("nats://cubes-bus:4444"));
    }

    #[test]
    fn test_payload_too_large_display() {
        let err = BusError::PayloadTooLarge { size: 2048, max: 1024 };
        assert_eq!(
            err.to_string(),
            "payload of 2048 bytes exceeds server limit of 1024 bytes"
        );
    }
}
