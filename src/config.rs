use std::num::NonZeroUsize;

use crate::error::ConfigError;

/// Upper bound on queued tasks, sized to cap memory rather than any domain limit
pub const DEFAULT_MAX_PENDING_TASKS: usize = 8172;

pub const DEFAULT_THREAD_NAME_PREFIX: &str = "pool-worker-";

/// Blocking primitive under every [`Condvar`](crate::Condvar) the pool creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeupStrategy {
    /// the platform condition variable
    #[default]
    Native,
    /// generation counting over a manual-reset event, for targets without one
    GenerationEvent,
}

/// Construction parameters for a [`ThreadPool`](crate::ThreadPool)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_active_workers: usize,
    pub max_pending_tasks: usize,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub wakeup: WakeupStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_active_workers: default_max_active_workers(),
            max_pending_tasks: DEFAULT_MAX_PENDING_TASKS,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
            wakeup: WakeupStrategy::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_active_workers(mut self, max_active_workers: usize) -> Self {
        self.max_active_workers = max_active_workers;
        self
    }

    pub fn with_max_pending_tasks(mut self, max_pending_tasks: usize) -> Self {
        self.max_pending_tasks = max_pending_tasks;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn with_wakeup(mut self, wakeup: WakeupStrategy) -> Self {
        self.wakeup = wakeup;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name_prefix.contains('\0') {
            return Err(ConfigError::InvalidThreadName);
        }
        if self.stack_size == Some(0) {
            return Err(ConfigError::ZeroStackSize);
        }
        Ok(())
    }
}

// two workers per logical core
fn default_max_active_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        * 2
}
