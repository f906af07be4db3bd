use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, Thread};

/// A manual-reset wakeup event built on thread parking
///
/// Once `set`, every waiter passes until the event is `reset`.
pub struct ManualResetEvent {
    signaled: AtomicBool,
    sleepers: Mutex<Vec<Thread>>,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        ManualResetEvent {
            signaled: AtomicBool::new(false),
            sleepers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    // wake everyone currently parked, the event stays signaled
    pub fn set(&self) {
        self.signaled.store(true, Ordering::Release);
        let sleepers = std::mem::take(&mut *self.sleepers());
        for sleeper in sleepers {
            sleeper.unpark();
        }
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    // block until the event is signaled
    pub fn wait(&self) {
        let me = thread::current();
        loop {
            if self.is_set() {
                return;
            }

            {
                let mut sleepers = self.sleepers();
                // re-check under the lock: `set` stores the flag before draining the list
                if self.is_set() {
                    return;
                }
                if !sleepers.iter().any(|t| t.id() == me.id()) {
                    sleepers.push(me.clone());
                }
            }

            // park returns at once if an unpark already arrived
            thread::park();
        }
    }

    fn sleepers(&self) -> MutexGuard<'_, Vec<Thread>> {
        self.sleepers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn wait_passes_while_set() {
        let event = ManualResetEvent::new();
        event.set();
        event.wait();
        event.wait();
        assert!(event.is_set());
    }

    #[test]
    fn reset_blocks_until_next_set() {
        let event = Arc::new(ManualResetEvent::new());
        event.set();
        event.reset();

        let (tx, rx) = mpsc::channel();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let event = Arc::clone(&event);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    event.wait();
                    tx.send(()).unwrap();
                })
            })
            .collect();

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        event.set();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
