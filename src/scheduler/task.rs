//! Queue entries that carry a job to a worker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of attempts: the first run plus three retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// A request to run the pipeline of one job.
///
/// The task id doubles as the job's external-task handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub id: Uuid,
    pub job_id: String,
    /// Deliveries so far, counted when a worker picks the task up.
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Error of the previous attempt, if any.
    pub last_error: Option<String>,
    /// The job still has to be moved back to QUEUED before the next attempt.
    #[serde(default)]
    pub needs_reset: bool,
}

impl PipelineTask {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: Utc::now(),
            last_error: None,
            needs_reset: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Called when a worker starts an attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Whether another attempt is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_accounting() {
        let mut task = PipelineTask::new("job-1").with_max_attempts(2);
        assert!(task.should_retry());
        assert_eq!(task.remaining_attempts(), 2);

        task.increment_attempts();
        assert!(task.should_retry());
        task.increment_attempts();
        assert!(!task.should_retry());
        assert_eq!(task.remaining_attempts(), 0);
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        let task = PipelineTask::new("job-1").with_max_attempts(0);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(900);

        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(900));
        assert_eq!(backoff_delay(base, max, 40), Duration::from_secs(900));
    }

    #[test]
    fn test_deserialize_without_reset_flag() {
        let task = PipelineTask::new("job-1");
        let mut value = serde_json::to_value(&task).unwrap();
        value.as_object_mut().unwrap().remove("needs_reset");

        let parsed: PipelineTask = serde_json::from_value(value).unwrap();
        assert!(!parsed.needs_reset);
        assert_eq!(parsed.id, task.id);
    }
}
