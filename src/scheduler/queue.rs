//! Task queue abstraction and its Redis implementation.
//!
//! The Redis queue keeps four structures per queue name:
//!
//! - `{queue_name}`: tasks waiting for a worker
//! - `{queue_name}:processing`: tasks handed to a worker (for crash recovery)
//! - `{queue_name}:delayed`: sorted set of retries waiting out their backoff
//! - `{queue_name}:dead_letter`: tasks that exhausted their attempts
//!
//! Cancellation requests live in `{queue_name}:cancel:{job_id}` keys so that a
//! worker in another process can observe them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use super::task::PipelineTask;

/// Cancellation flags expire after a day if nobody clears them.
const CANCEL_FLAG_TTL_SECS: u64 = 86_400;

/// Moves due entries of the delayed set onto the dequeue end of the main list.
const PROMOTE_DELAYED: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, task in ipairs(due) do
  redis.call('ZREM', KEYS[1], task)
  redis.call('RPUSH', KEYS[2], task)
end
return #due
";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the operation may succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) => true,
            QueueError::RedisError(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            QueueError::SerializationFailed(_) => false,
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: usize,
    pub processing: usize,
    pub delayed: usize,
    pub dead_letter: usize,
}

impl QueueStats {
    /// Tasks that will still be picked up by a worker.
    pub fn backlog(&self) -> usize {
        self.pending + self.delayed
    }
}

/// Durable hand-off point between producers and workers.
///
/// A dequeued task stays in the processing set until it is completed,
/// requeued or dead-lettered.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn enqueue(&self, task: PipelineTask) -> Result<(), QueueError>;

    /// Waits up to `timeout` for the next ready task.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<PipelineTask>, QueueError>;

    /// Acknowledges a task; it is removed from the processing set.
    async fn complete(&self, task: &PipelineTask) -> Result<(), QueueError>;

    /// Puts a task back, ready again after `delay`.
    async fn requeue(&self, task: PipelineTask, delay: Duration) -> Result<(), QueueError>;

    async fn dead_letter(&self, task: PipelineTask, reason: &str) -> Result<(), QueueError>;

    /// Drains the processing set left behind by workers that died.
    async fn recover_processing(&self) -> Result<Vec<PipelineTask>, QueueError>;

    async fn request_cancel(&self, job_id: &str) -> Result<(), QueueError>;

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, QueueError>;

    async fn clear_cancel(&self, job_id: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Redis-based task queue with reliable dequeue.
pub struct RedisTaskQueue {
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    delayed_set: String,
    dead_letter_queue: String,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a new task queue.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            delayed_set: format!("{}:delayed", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
        }
    }

    fn cancel_key(&self, job_id: &str) -> String {
        cancel_key(&self.queue_name, job_id)
    }

    async fn promote_delayed(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let promoted: usize = redis::Script::new(PROMOTE_DELAYED)
            .key(&self.delayed_set)
            .key(&self.queue_name)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            tracing::debug!(queue = %self.queue_name, promoted, "Promoted delayed tasks");
        }
        Ok(promoted)
    }

    async fn remove_task_from_processing(&self, task_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for entry in entries {
            if let Ok(task) = serde_json::from_str::<PipelineTask>(&entry) {
                if task.id == task_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &entry)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Already gone, e.g. drained by recovery.
        Ok(())
    }

    /// Peeks at dead-lettered entries without removing them.
    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn enqueue(&self, task: PipelineTask) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&task)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        tracing::debug!(queue = %self.queue_name, task_id = %task.id, job_id = %task.job_id, "Task enqueued");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<PipelineTask>, QueueError> {
        self.promote_delayed().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => match serde_json::from_str::<PipelineTask>(&data) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    // Unreadable entries would be recovered forever otherwise.
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)
                        .await?;
                    let entry = serde_json::json!({
                        "raw": data,
                        "error": e.to_string(),
                        "moved_at": Utc::now().to_rfc3339(),
                    });
                    conn.lpush::<_, _, ()>(&self.dead_letter_queue, entry.to_string())
                        .await?;
                    Err(e.into())
                }
            },
            None => Ok(None),
        }
    }

    async fn complete(&self, task: &PipelineTask) -> Result<(), QueueError> {
        self.remove_task_from_processing(task.id).await
    }

    async fn requeue(&self, task: PipelineTask, delay: Duration) -> Result<(), QueueError> {
        self.remove_task_from_processing(task.id).await?;

        let serialized = serde_json::to_string(&task)?;
        let mut conn = self.redis.clone();

        if delay.is_zero() {
            conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;
        } else {
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            redis::cmd("ZADD")
                .arg(&self.delayed_set)
                .arg(ready_at)
                .arg(serialized)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn dead_letter(&self, task: PipelineTask, reason: &str) -> Result<(), QueueError> {
        self.remove_task_from_processing(task.id).await?;

        let entry = serde_json::json!({
            "task": task,
            "error": reason,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;

        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;
        Ok(())
    }

    async fn recover_processing(&self) -> Result<Vec<PipelineTask>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        let mut recovered = Vec::new();

        for entry in entries {
            let removed: usize = conn.lrem(&self.processing_queue, 1, &entry).await?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<PipelineTask>(&entry) {
                Ok(task) => recovered.push(task),
                Err(e) => {
                    tracing::warn!(queue = %self.queue_name, error = %e, "Dropping unreadable task from processing list");
                }
            }
        }

        Ok(recovered)
    }

    async fn request_cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(self.cancel_key(job_id))
            .arg(Utc::now().to_rfc3339())
            .arg("EX")
            .arg(CANCEL_FLAG_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.cancel_key(job_id)).await?;
        Ok(exists)
    }

    async fn clear_cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.cancel_key(job_id)).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, processing, delayed, dead_letter): (usize, usize, usize, usize) =
            redis::pipe()
                .llen(&self.queue_name)
                .llen(&self.processing_queue)
                .zcard(&self.delayed_set)
                .llen(&self.dead_letter_queue)
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending,
            processing,
            delayed,
            dead_letter,
        })
    }
}

fn cancel_key(queue_name: &str, job_id: &str) -> String {
    format!("{}:cancel:{}", queue_name, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_serialization_error_is_permanent() {
        let parse_err = serde_json::from_str::<PipelineTask>("{").unwrap_err();
        let err = QueueError::from(parse_err);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_queue_stats_backlog() {
        let stats = QueueStats {
            queue_name: "jobs".to_string(),
            pending: 3,
            processing: 2,
            delayed: 4,
            dead_letter: 1,
        };
        assert_eq!(stats.backlog(), 7);
    }

    #[test]
    fn test_cancel_key_layout() {
        assert_eq!(cancel_key("fold_forge_jobs", "abc"), "fold_forge_jobs:cancel:abc");
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let task = PipelineTask::new("job-1");
        let entry = serde_json::json!({
            "task": task,
            "error": "attempts exhausted",
            "moved_at": Utc::now().to_rfc3339(),
        });

        let parsed: serde_json::Value =
            serde_json::from_str(&entry.to_string()).expect("should parse back");
        assert_eq!(parsed["task"]["job_id"], "job-1");
        assert_eq!(parsed["error"], "attempts exhausted");
    }
}
