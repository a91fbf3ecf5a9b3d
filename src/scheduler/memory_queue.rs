//! In-process task queue for single-process deployments and tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::queue::{QueueError, QueueStats, TaskQueue};
use super::task::PipelineTask;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PipelineTask>,
    processing: Vec<PipelineTask>,
    delayed: Vec<(Instant, PipelineTask)>,
    dead_letter: Vec<(PipelineTask, String)>,
    cancels: HashSet<String>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, task) = self.delayed.swap_remove(index);
                self.pending.push_front(task);
            } else {
                index += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn take_processing(&mut self, task_id: uuid::Uuid) {
        self.processing.retain(|t| t.id != task_id);
    }
}

/// Mirror of the Redis queue semantics kept in memory.
pub struct MemoryTaskQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dead-lettered tasks with their reasons.
    pub fn dead_letters(&self) -> Vec<(PipelineTask, String)> {
        self.lock().dead_letter.clone()
    }

    /// Tasks currently handed to a worker.
    pub fn in_processing(&self) -> Vec<PipelineTask> {
        self.lock().processing.clone()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, task: PipelineTask) -> Result<(), QueueError> {
        self.lock().pending.push_back(task);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<PipelineTask>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();

            let wake_at = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(task) = state.pending.pop_front() {
                    state.processing.push(task.clone());
                    return Ok(Some(task));
                }
                state
                    .next_due()
                    .map_or(deadline, |due| due.min(deadline))
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, task: &PipelineTask) -> Result<(), QueueError> {
        self.lock().take_processing(task.id);
        Ok(())
    }

    async fn requeue(&self, task: PipelineTask, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            state.take_processing(task.id);
            if delay.is_zero() {
                state.pending.push_front(task);
            } else {
                state.delayed.push((Instant::now() + delay, task));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, task: PipelineTask, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.take_processing(task.id);
        state.dead_letter.push((task, reason.to_string()));
        Ok(())
    }

    async fn recover_processing(&self) -> Result<Vec<PipelineTask>, QueueError> {
        Ok(std::mem::take(&mut self.lock().processing))
    }

    async fn request_cancel(&self, job_id: &str) -> Result<(), QueueError> {
        self.lock().cancels.insert(job_id.to_string());
        Ok(())
    }

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, QueueError> {
        Ok(self.lock().cancels.contains(job_id))
    }

    async fn clear_cancel(&self, job_id: &str) -> Result<(), QueueError> {
        self.lock().cancels.remove(job_id);
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        Ok(QueueStats {
            queue_name: self.name.clone(),
            pending: state.pending.len(),
            processing: state.processing.len(),
            delayed: state.delayed.len(),
            dead_letter: state.dead_letter.len(),
        })
    }
}
