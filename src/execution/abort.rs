//! Abort signal handed to every container run.
//!
//! A signal wraps a [`CancellationToken`] together with the reason it fired,
//! so the runner can tell an operator cancel from a dispatcher timeout after
//! it has force-killed the container.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// An operator cancelled the job.
    Cancelled,
    /// The job exceeded its hard wall-clock limit.
    TimedOut { seconds: u64 },
}

/// Shared, clonable abort trigger. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal.
    pub fn abort(&self, reason: AbortReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Fires the signal as an operator cancel.
    pub fn cancel(&self) {
        self.abort(AbortReason::Cancelled);
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    /// Resolves once the signal fires.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// Runner error matching the abort reason.
    pub fn runner_error(&self) -> RunnerError {
        match self.reason() {
            Some(AbortReason::TimedOut { seconds }) => RunnerError::Timeout { seconds },
            _ => RunnerError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_signal_is_idle() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = AbortSignal::new();
        signal.abort(AbortReason::TimedOut { seconds: 30 });
        signal.cancel();

        assert!(signal.is_aborted());
        assert_eq!(signal.reason(), Some(AbortReason::TimedOut { seconds: 30 }));
        assert!(matches!(
            signal.runner_error(),
            RunnerError::Timeout { seconds: 30 }
        ));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = AbortSignal::new();
        let observer = signal.clone();

        let waiter = tokio::spawn(async move {
            observer.aborted().await;
            observer.runner_error()
        });
        signal.cancel();

        let error = waiter.await.unwrap();
        assert!(matches!(error, RunnerError::Cancelled));
    }
}
