// Bounded-Pool: worker-pool scheduler on hand-built synchronization primitives
// - RecursiveMutex: re-entrant lock, guards hand out shared access
// - Condvar: generation-count condition variable over a RecursiveMutex,
//   blocking on the platform condvar or a manual-reset event
// - ThreadPool: lazily spawned, recycled workers, a bounded FIFO of pending
//   tasks and blocking waits for idleness or for a single task
//
// Backpressure
// `add_item` returns false once every worker slot is busy and the pending
// queue is full. The pool never retries on its own.
//
// Ownership
// Tasks are `Arc<dyn Runnable>` handles owned by the caller. The pool keeps a
// clone while a task is queued or running and never inspects its status code.
mod condvar;
mod config;
mod error;
mod manual_reset_event;
mod pool;
mod recursive_mutex;
mod task;
mod worker;

pub use condvar::Condvar;
pub use config::{DEFAULT_MAX_PENDING_TASKS, DEFAULT_THREAD_NAME_PREFIX, PoolConfig, WakeupStrategy};
pub use error::{ConfigError, SubmitError};
pub use manual_reset_event::ManualResetEvent;
pub use pool::ThreadPool;
pub use recursive_mutex::{RecursiveMutex, RecursiveMutexGuard};
pub use task::{Runnable, Task, task};

// convenience function to create a pool with the default limits
pub fn new() -> ThreadPool {
    ThreadPool::new()
}

// create a pool with specific worker and queue limits
pub fn with_limits(max_active_workers: usize, max_pending_tasks: usize) -> ThreadPool {
    let config = PoolConfig::default()
        .with_max_active_workers(max_active_workers)
        .with_max_pending_tasks(max_pending_tasks);
    match ThreadPool::with_config(config) {
        Ok(pool) => pool,
        Err(err) => unreachable!("default thread settings are valid: {err}"),
    }
}
