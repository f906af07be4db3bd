use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use log::{debug, error, trace, warn};

use crate::condvar::Condvar;
use crate::config::PoolConfig;
use crate::error::{ConfigError, SubmitError};
use crate::recursive_mutex::{RecursiveMutex, RecursiveMutexGuard};
use crate::task::{Task, TaskId};
use crate::worker::{Worker, WorkerId, WorkerSettings};

// everything behind the pool lock
struct PoolState {
    active: HashMap<WorkerId, Worker>,
    idle: Vec<Worker>,
    pending: VecDeque<Task>,
    // task -> someone is blocked in wait_for_item on it
    waiters: HashMap<TaskId, bool>,
    max_active_workers: usize,
    max_pending_tasks: usize,
    next_worker_id: WorkerId,
}

impl PoolState {
    fn is_worker_thread(&self) -> bool {
        let me = thread::current().id();
        self.active
            .values()
            .chain(self.idle.iter())
            .any(|worker| worker.thread_id() == me)
    }

    // drop queued tasks without running them, returns the count and whether anyone waited on one
    fn discard_pending(&mut self) -> (usize, bool) {
        let pending = std::mem::take(&mut self.pending);
        let mut had_waiter = false;
        for task in &pending {
            had_waiter |= self.waiters.remove(&TaskId::of(task)).unwrap_or(false);
        }
        (pending.len(), had_waiter)
    }
}

pub(crate) struct Shared {
    state: RecursiveMutex<RefCell<PoolState>>,
    changed: Condvar,
    settings: WorkerSettings,
}

impl Shared {
    // a worker thread returned from `run`, hand it the next queued task or park it
    pub(crate) fn on_item_completion(&self, task: &Task, worker_id: WorkerId) {
        let guard = self.state.lock();
        let mut wake = false;
        {
            let mut state = guard.borrow_mut();
            let state = &mut *state;

            let promote = state.active.len() <= state.max_active_workers;
            match state.active.remove(&worker_id) {
                Some(mut worker) => {
                    debug_assert_eq!(worker.assigned(), Some(TaskId::of(task)));
                    let next = if promote {
                        state.pending.pop_front()
                    } else {
                        None
                    };
                    match next {
                        Some(next) => {
                            trace!("promoting queued task to worker {worker_id}");
                            worker.assign(next);
                            state.active.insert(worker_id, worker);
                        }
                        None => {
                            worker.release();
                            state.idle.push(worker);
                            wake |= state.active.is_empty();
                        }
                    }
                }
                None => error!("completion reported by worker {worker_id} which is not active"),
            }

            wake |= state.waiters.remove(&TaskId::of(task)).unwrap_or(false);
        }

        if wake {
            self.changed.broadcast();
        }
    }
}

/// Bounded worker-pool scheduler
///
/// Tasks are handed straight to a free worker while fewer than
/// `max_active_workers` are busy, queued in FIFO order while fewer than
/// `max_pending_tasks` wait, and rejected otherwise. Workers are created on
/// demand and kept on an idle list for reuse.
///
/// Dropping the pool runs `clean_up(true)`: queued tasks are discarded,
/// running tasks finish and every worker thread is joined.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Create a pool with the default limits
    pub fn new() -> Self {
        let config = PoolConfig::default();
        Self::from_valid_config(config)
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: PoolConfig) -> Self {
        let state = PoolState {
            active: HashMap::new(),
            idle: Vec::new(),
            pending: VecDeque::new(),
            waiters: HashMap::new(),
            max_active_workers: config.max_active_workers,
            max_pending_tasks: config.max_pending_tasks,
            next_worker_id: 0,
        };

        ThreadPool {
            shared: Arc::new(Shared {
                state: RecursiveMutex::new(RefCell::new(state)),
                changed: Condvar::with_strategy(config.wakeup),
                settings: WorkerSettings {
                    name_prefix: config.thread_name_prefix,
                    stack_size: config.stack_size,
                    wakeup: config.wakeup,
                },
            }),
        }
    }

    fn lock(&self) -> RecursiveMutexGuard<'_, RefCell<PoolState>> {
        self.shared.state.lock()
    }

    /// Submit a task, returns `false` when the pool is saturated
    ///
    /// See [`try_add_item`](Self::try_add_item) for the reason of a rejection.
    pub fn add_item(&self, task: &Task) -> bool {
        self.try_add_item(task).is_ok()
    }

    /// Submit a task for execution
    ///
    /// The task starts on a worker right away if a worker slot is free,
    /// otherwise it is queued if the pending queue has room. A rejected task
    /// leaves the pool untouched; retrying, dropping or blocking is up to
    /// the caller.
    pub fn try_add_item(&self, task: &Task) -> Result<(), SubmitError> {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        let state = &mut *state;

        let id = TaskId::of(task);
        if state.waiters.contains_key(&id) {
            warn!("rejecting a task that is already queued or running");
            return Err(SubmitError::AlreadyRegistered);
        }

        if state.active.len() < state.max_active_workers {
            let mut worker = match state.idle.pop() {
                Some(worker) => worker,
                None => {
                    let worker_id = state.next_worker_id;
                    state.next_worker_id += 1;
                    Worker::spawn(worker_id, Arc::downgrade(&self.shared), &self.shared.settings)
                        .unwrap_or_else(|err| panic!("failed to spawn pool worker thread: {err}"))
                }
            };
            // the worker reports back through the pool lock, which we still hold
            worker.assign(Arc::clone(task));
            state.active.insert(worker.id(), worker);
        } else if state.pending.len() < state.max_pending_tasks {
            trace!("all workers busy, queueing task");
            state.pending.push_back(Arc::clone(task));
        } else {
            return Err(SubmitError::Saturated {
                active: state.active.len(),
                pending: state.pending.len(),
            });
        }

        state.waiters.insert(id, false);
        Ok(())
    }

    /// Block until no worker holds a task
    ///
    /// With no concurrent submissions this also means the pending queue is
    /// empty, since a finishing worker picks up the next queued task.
    ///
    /// # Panics
    /// When called from one of this pool's worker threads.
    pub fn wait_for_idle(&self) {
        let guard = self.lock();
        assert!(
            !guard.borrow().is_worker_thread(),
            "wait_for_idle called from a worker of the same pool"
        );
        let _guard = self
            .shared
            .changed
            .wait_while(guard, |state| !state.borrow().active.is_empty());
    }

    /// Block until `task` has completed
    ///
    /// Works whether the task is queued or running. Returns immediately if
    /// the task is not registered with the pool.
    pub fn wait_for_item(&self, task: &Task) {
        let id = TaskId::of(task);
        let guard = self.lock();
        {
            let mut state = guard.borrow_mut();
            match state.waiters.get_mut(&id) {
                Some(has_waiter) => *has_waiter = true,
                None => return,
            }
        }
        let _guard = self
            .shared
            .changed
            .wait_while(guard, |state| state.borrow().waiters.contains_key(&id));
    }

    /// Change the worker limit
    ///
    /// Idle workers beyond the new limit are destroyed right away. Busy
    /// workers are never interrupted, a lower limit takes effect as they
    /// finish. Raising the limit does not start queued tasks: promotion
    /// happens on the next completion or submission.
    pub fn set_max_active_workers(&self, max_active_workers: usize) {
        let retired = {
            let guard = self.lock();
            let mut state = guard.borrow_mut();
            state.max_active_workers = max_active_workers;

            let total = state.active.len() + state.idle.len();
            let excess = total.saturating_sub(max_active_workers).min(state.idle.len());
            let keep = state.idle.len() - excess;
            state.idle.split_off(keep)
        };

        if !retired.is_empty() {
            debug!("retiring {} idle workers", retired.len());
        }
        // joined outside the pool lock
        drop(retired);
    }

    /// Change the pending queue bound, already queued tasks stay queued
    pub fn set_max_pending_tasks(&self, max_pending_tasks: usize) {
        self.lock().borrow_mut().max_pending_tasks = max_pending_tasks;
    }

    /// Destroy idle workers, and with `terminate` shut the pool down
    ///
    /// Terminating discards every queued task without running it, waits for
    /// running tasks to finish, then joins every remaining worker. Threads
    /// blocked in `wait_for_item` on a discarded task return.
    ///
    /// # Panics
    /// When `terminate` is set and the call comes from one of this pool's
    /// worker threads.
    pub fn clean_up(&self, terminate: bool) {
        let guard = self.lock();
        if terminate {
            assert!(
                !guard.borrow().is_worker_thread(),
                "clean_up(true) called from a worker of the same pool"
            );
        }

        let idle = std::mem::take(&mut guard.borrow_mut().idle);
        if !idle.is_empty() {
            debug!("destroying {} idle workers", idle.len());
        }
        drop(idle);

        if !terminate {
            return;
        }

        self.discard_pending(&guard);
        // re-enters the pool lock, the wait releases both levels
        self.wait_for_idle();
        self.discard_pending(&guard);

        let (active, idle) = {
            let mut state = guard.borrow_mut();
            (
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.idle),
            )
        };
        debug!(
            "pool terminated, joining {} workers",
            active.len() + idle.len()
        );
        drop(active);
        drop(idle);
    }

    fn discard_pending(&self, guard: &RecursiveMutexGuard<'_, RefCell<PoolState>>) {
        let (discarded, had_waiter) = guard.borrow_mut().discard_pending();
        if discarded > 0 {
            debug!("discarding {discarded} queued tasks");
        }
        if had_waiter {
            self.shared.changed.broadcast();
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.lock().borrow().active.len()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.lock().borrow().idle.len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.lock().borrow().pending.len()
    }

    pub fn has_active_workers(&self) -> bool {
        !self.lock().borrow().active.is_empty()
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.lock().borrow().pending.is_empty()
    }

    pub fn max_active_workers(&self) -> usize {
        self.lock().borrow().max_active_workers
    }

    pub fn max_pending_tasks(&self) -> usize {
        self.lock().borrow().max_pending_tasks
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let guard = self.lock();
        let state = guard.borrow();
        assert!(state.active.values().all(|worker| worker.assigned().is_some()));
        assert!(state.idle.iter().all(|worker| worker.assigned().is_none()));

        let running: Vec<TaskId> = state.active.values().filter_map(Worker::assigned).collect();
        let queued: Vec<TaskId> = state.pending.iter().map(TaskId::of).collect();
        assert!(running.iter().all(|id| !queued.contains(id)));
        assert_eq!(state.waiters.len(), running.len() + queued.len());
        assert!(running.iter().chain(queued.iter()).all(|id| state.waiters.contains_key(id)));
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.clean_up(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use std::sync::mpsc;
    use std::time::Duration;

    fn limits(max_active: usize, max_pending: usize) -> ThreadPool {
        ThreadPool::with_config(
            PoolConfig::default()
                .with_max_active_workers(max_active)
                .with_max_pending_tasks(max_pending),
        )
        .unwrap()
    }

    fn gated() -> (Task, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel::<()>();
        let rx = std::sync::Mutex::new(rx);
        let t = task(move || {
            let _ = rx.lock().unwrap().recv();
            0
        });
        (t, tx)
    }

    #[test]
    fn bookkeeping_holds_through_a_busy_cycle() {
        let pool = limits(2, 4);
        let (first, open_first) = gated();
        let (second, open_second) = gated();
        let queued: Vec<Task> = (0..3).map(|_| task(|| 0)).collect();

        assert!(pool.add_item(&first));
        assert!(pool.add_item(&second));
        for t in &queued {
            assert!(pool.add_item(t));
        }
        pool.check_invariants();
        assert_eq!(pool.active_worker_count(), 2);
        assert_eq!(pool.pending_task_count(), 3);

        open_first.send(()).unwrap();
        open_second.send(()).unwrap();
        pool.wait_for_idle();
        pool.check_invariants();
        assert_eq!(pool.active_worker_count(), 0);
        assert_eq!(pool.pending_task_count(), 0);
        assert_eq!(pool.idle_worker_count(), 2);
    }

    #[test]
    fn completion_from_an_overfull_pool_parks_the_worker() {
        let pool = limits(2, 4);
        let (first, open_first) = gated();
        let (second, open_second) = gated();
        let queued = task(|| 0);

        assert!(pool.add_item(&first));
        assert!(pool.add_item(&second));
        assert!(pool.add_item(&queued));

        // shrink below the active count: finishing workers go idle
        pool.set_max_active_workers(1);
        open_first.send(()).unwrap();
        pool.wait_for_item(&first);
        pool.check_invariants();
        assert_eq!(pool.active_worker_count(), 1);
        assert_eq!(pool.idle_worker_count(), 1);
        assert_eq!(pool.pending_task_count(), 1);

        open_second.send(()).unwrap();
        pool.wait_for_item(&queued);
        pool.wait_for_idle();
        pool.check_invariants();
        assert_eq!(pool.pending_task_count(), 0);
        assert_eq!(pool.idle_worker_count(), 2);
    }

    #[test]
    fn running_tasks_are_not_queued_twice() {
        let pool = limits(1, 1);
        let (blocker, open) = gated();
        assert!(pool.add_item(&blocker));
        assert_eq!(pool.try_add_item(&blocker), Err(SubmitError::AlreadyRegistered));
        pool.check_invariants();

        open.send(()).unwrap();
        pool.wait_for_idle();
        // once completed the same handle may be submitted again
        let (tx, rx) = mpsc::channel();
        let again = task(move || {
            tx.send(()).unwrap();
            0
        });
        assert!(pool.add_item(&again));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.wait_for_item(&again);
        assert!(pool.add_item(&again));
        pool.wait_for_idle();
    }
}
