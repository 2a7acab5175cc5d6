//! Subject helpers.
//!
//! Subjects are dot separated tokens. Subscriptions may use `*` to match
//! exactly one token and a trailing `>` to match one or more tokens, so a log
//! collector can listen on `log.error.>` or `log.*.gateway.*`.

use crate::BusError;
use uuid::Uuid;

/// Prefix for ephemeral reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Build a fresh, unique reply subject.
#[must_use]
pub fn new_inbox() -> String {
    format!("{}{}", INBOX_PREFIX, Uuid::new_v4().simple())
}

/// Check whether `subject` is matched by the subscription `pattern`.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject subjects the wire protocol cannot carry.
pub fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty()
        || subject.chars().any(char::is_whitespace)
        || subject.split('.').any(str::is_empty)
    {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
