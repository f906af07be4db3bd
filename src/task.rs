use std::sync::Arc;

/// A unit of work the pool can execute
///
/// The returned status code is never inspected by the pool. Tasks that need
/// to report failure keep their own result state.
pub trait Runnable: Send + Sync {
    fn run(&self) -> i32;
}

impl<F> Runnable for F
where
    F: Fn() -> i32 + Send + Sync,
{
    fn run(&self) -> i32 {
        self()
    }
}

/// Caller-owned handle to a task, its identity is the allocation it points to
pub type Task = Arc<dyn Runnable>;

// convenience function to wrap a closure into a task handle
pub fn task<F>(f: F) -> Task
where
    F: Fn() -> i32 + Send + Sync + 'static,
{
    Arc::new(f)
}

// waiter map key, stable while the pool holds a clone of the handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(usize);

impl TaskId {
    pub(crate) fn of(task: &Task) -> Self {
        TaskId(Arc::as_ptr(task) as *const () as usize)
    }
}
