//! Lifecycle states and termination signals.
//!
//! ```text
//! Constructed → PoolOpen → DispatchersRunning → HandlerStarted → Running
//!                                                                   │
//!                               Stopped ← ShuttingDown ←────────────┘
//! ```
//!
//! A failure before `Running` tears down what was built and moves straight
//! to `Stopped`.

use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    PoolOpen,
    DispatchersRunning,
    HandlerStarted,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    /// True once shutdown has begun.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::ShuttingDown | LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Constructed => "constructed",
            LifecycleState::PoolOpen => "pool-open",
            LifecycleState::DispatchersRunning => "dispatchers-running",
            LifecycleState::HandlerStarted => "handler-started",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Resolve on SIGINT or SIGTERM (ctrl-c elsewhere).
///
/// If no handler can be installed this never resolves, leaving
/// `Node::stop` as the only way out.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(LifecycleState::ShuttingDown.is_terminal());
        assert!(LifecycleState::Stopped.is_terminal());
        assert!(!LifecycleState::Running.is_terminal());
        assert!(!LifecycleState::Constructed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(LifecycleState::DispatchersRunning.to_string(), "dispatchers-running");
    }
}
