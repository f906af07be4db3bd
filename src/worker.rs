use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, error, trace, warn};

use crate::condvar::Condvar;
use crate::config::WakeupStrategy;
use crate::pool::Shared;
use crate::recursive_mutex::RecursiveMutex;
use crate::task::{Task, TaskId};

pub(crate) type WorkerId = usize;

// thread settings shared by every worker of a pool
pub(crate) struct WorkerSettings {
    pub name_prefix: String,
    pub stack_size: Option<usize>,
    pub wakeup: WakeupStrategy,
}

#[derive(Default)]
struct Mailbox {
    task: Option<Task>,
    terminate: bool,
}

// the worker's private handoff, separate from the pool lock
struct Inbox {
    mailbox: RecursiveMutex<RefCell<Mailbox>>,
    posted: Condvar,
}

impl Inbox {
    fn new(wakeup: WakeupStrategy) -> Self {
        Inbox {
            mailbox: RecursiveMutex::new(RefCell::new(Mailbox::default())),
            posted: Condvar::with_strategy(wakeup),
        }
    }

    fn post(&self, task: Task) {
        let guard = self.mailbox.lock();
        let previous = guard.borrow_mut().task.replace(task);
        debug_assert!(previous.is_none(), "worker handed a task while holding one");
        self.posted.signal();
    }

    fn terminate(&self) {
        let guard = self.mailbox.lock();
        guard.borrow_mut().terminate = true;
        self.posted.signal();
    }

    // park until a task arrives, None once termination was requested
    fn next_task(&self) -> Option<Task> {
        let guard = self.mailbox.lock();
        let guard = self.posted.wait_while(guard, |mailbox| {
            let mailbox = mailbox.borrow();
            mailbox.task.is_none() && !mailbox.terminate
        });
        let mut mailbox = guard.borrow_mut();
        if mailbox.terminate {
            None
        } else {
            mailbox.task.take()
        }
    }
}

/// One OS thread executing at most one task at a time
///
/// Owned by the pool's active or idle list. Dropping a worker requests
/// termination and joins its thread, waiting for a running task to finish.
pub(crate) struct Worker {
    id: WorkerId,
    thread_id: ThreadId,
    inbox: Arc<Inbox>,
    assigned: Option<TaskId>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        id: WorkerId,
        pool: Weak<Shared>,
        settings: &WorkerSettings,
    ) -> io::Result<Worker> {
        let inbox = Arc::new(Inbox::new(settings.wakeup));

        let mut builder = thread::Builder::new().name(format!("{}{}", settings.name_prefix, id));
        if let Some(stack_size) = settings.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread_inbox = Arc::clone(&inbox);
        let handle = builder.spawn(move || run_worker(id, &thread_inbox, &pool))?;
        debug!("spawned pool worker {id}");

        Ok(Worker {
            id,
            thread_id: handle.thread().id(),
            inbox,
            assigned: None,
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn assigned(&self) -> Option<TaskId> {
        self.assigned
    }

    // hand a task to the worker thread, wakes it if parked
    pub(crate) fn assign(&mut self, task: Task) {
        self.assigned = Some(TaskId::of(&task));
        trace!("assigning task to worker {}", self.id);
        self.inbox.post(task);
    }

    // the worker finished its task and goes back to the idle list
    pub(crate) fn release(&mut self) {
        self.assigned = None;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.inbox.terminate();

        if let Some(handle) = self.handle.take() {
            assert_ne!(
                handle.thread().id(),
                thread::current().id(),
                "pool worker {} cannot tear itself down",
                self.id
            );
            if handle.join().is_err() {
                error!("pool worker {} exited with a panic", self.id);
            }
        }
    }
}

fn run_worker(id: WorkerId, inbox: &Inbox, pool: &Weak<Shared>) {
    while let Some(task) = inbox.next_task() {
        match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(status) => trace!("worker {id} finished a task with status {status}"),
            Err(_) => error!("worker {id}: task panicked, reporting it as completed"),
        }

        // the pool joins every worker before it goes away
        match pool.upgrade() {
            Some(shared) => shared.on_item_completion(&task, id),
            None => {
                warn!("worker {id} outlived its pool");
                break;
            }
        }
    }

    debug!("pool worker {id} exiting");
}
