use thiserror::Error;

/// Why a task was not accepted by [`ThreadPool::try_add_item`](crate::ThreadPool::try_add_item)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// every worker slot is busy and the pending queue is at capacity
    #[error("pool is saturated: {active} active workers, {pending} pending tasks")]
    Saturated { active: usize, pending: usize },

    /// the same task handle is still queued or running
    #[error("task is already registered with this pool")]
    AlreadyRegistered,
}

/// Rejected [`PoolConfig`](crate::PoolConfig) values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("thread name prefix must not contain a NUL byte")]
    InvalidThreadName,

    #[error("worker stack size must be non-zero")]
    ZeroStackSize,
}
