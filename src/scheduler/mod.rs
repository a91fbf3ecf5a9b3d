//! Task dispatch: queues, workers and the producer-side dispatcher.
//!
//! - **TaskQueue**: durable hand-off with processing set, delayed retries,
//!   dead letters and cancel flags (`RedisTaskQueue`, `MemoryTaskQueue`)
//! - **WorkerPool**: workers that each run one pipeline at a time
//! - **Dispatcher**: submit, cancel and retry for callers
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Dispatcher  │
//!                      │ (service/CLI)│
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Reliability
//!
//! - **Atomic dequeue**: tasks move to the processing set as they are handed out
//! - **Crash recovery**: orphaned tasks are requeued when a pool starts
//! - **Bounded retries**: transient failures back off exponentially, then dead-letter
//! - **Graceful shutdown**: workers finish their current run before stopping

pub mod dispatcher;
pub mod memory_queue;
pub mod queue;
pub mod task;
pub mod worker_pool;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatchError, CANCELLED_MESSAGE};
pub use memory_queue::MemoryTaskQueue;
pub use queue::{QueueError, QueueStats, RedisTaskQueue, TaskQueue};
pub use task::{backoff_delay, PipelineTask, DEFAULT_MAX_ATTEMPTS};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig, WORKER_LOST_MESSAGE};
