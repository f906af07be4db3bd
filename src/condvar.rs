// Condition variable over a RecursiveMutex using the generation-count technique.
//
// Every waiter registers under the counter lock and snapshots the current
// generation before it releases the caller's mutex, so a signal issued after
// the wait began can never be lost. A waiter may only leave once a release is
// outstanding and the generation moved past its snapshot, so a late waiter
// cannot steal a wakeup that belongs to an earlier wait cycle.
//
// Two blocking primitives sit under the same counters:
// - Native: a std condvar paired with the counter lock (hosted targets)
// - GenerationEvent: a manual-reset event, the portable fallback for targets
//   without a native condition variable
use std::sync::{Condvar as NativeCondvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::config::WakeupStrategy;
use crate::manual_reset_event::ManualResetEvent;
use crate::recursive_mutex::RecursiveMutexGuard;

#[derive(Default)]
struct Generations {
    waiters: usize,
    releases: usize,
    generation: u64,
}

impl Generations {
    fn register(&mut self) -> u64 {
        self.waiters += 1;
        self.generation
    }

    fn can_leave(&self, my_generation: u64) -> bool {
        self.releases > 0 && self.generation != my_generation
    }

    // returns true once the last outstanding release was consumed
    fn leave(&mut self) -> bool {
        self.waiters -= 1;
        self.releases -= 1;
        self.releases == 0
    }

    fn signal(&mut self) -> bool {
        if self.waiters > self.releases {
            self.releases += 1;
            self.generation = self.generation.wrapping_add(1);
            true
        } else {
            false
        }
    }

    fn broadcast(&mut self) -> bool {
        if self.waiters > 0 {
            self.releases = self.waiters;
            self.generation = self.generation.wrapping_add(1);
            true
        } else {
            false
        }
    }
}

enum Wakeup {
    Native(NativeCondvar),
    Event(ManualResetEvent),
}

/// Wait / signal / broadcast over a [`RecursiveMutex`](crate::RecursiveMutex)
///
/// `wait` releases every recursion level the caller holds, blocks until a
/// `signal` or `broadcast` issued after the wait began, then restores the
/// levels before returning. `signal` releases at most one blocked waiter and
/// `broadcast` releases all of them. There are no spurious returns.
pub struct Condvar {
    generations: Mutex<Generations>,
    wakeup: Wakeup,
}

impl Condvar {
    /// Create a condition variable blocking on the platform condvar
    pub fn new() -> Self {
        Self::with_strategy(WakeupStrategy::Native)
    }

    pub fn with_strategy(strategy: WakeupStrategy) -> Self {
        let wakeup = match strategy {
            WakeupStrategy::Native => Wakeup::Native(NativeCondvar::new()),
            WakeupStrategy::GenerationEvent => Wakeup::Event(ManualResetEvent::new()),
        };
        Condvar {
            generations: Mutex::new(Generations::default()),
            wakeup,
        }
    }

    pub fn strategy(&self) -> WakeupStrategy {
        match self.wakeup {
            Wakeup::Native(_) => WakeupStrategy::Native,
            Wakeup::Event(_) => WakeupStrategy::GenerationEvent,
        }
    }

    /// Block until signaled, releasing the mutex meanwhile
    pub fn wait<'a, T: ?Sized>(&self, guard: RecursiveMutexGuard<'a, T>) -> RecursiveMutexGuard<'a, T> {
        let mutex = RecursiveMutexGuard::into_mutex(guard);

        let depth = match &self.wakeup {
            Wakeup::Native(condvar) => {
                let mut generations = self.generations();
                let my_generation = generations.register();
                // still holding the counter lock: no signal can slip in before we sleep
                let depth = mutex.release_all();
                while !generations.can_leave(my_generation) {
                    generations = condvar
                        .wait(generations)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                generations.leave();
                depth
            }
            Wakeup::Event(event) => {
                let my_generation = self.generations().register();
                let depth = mutex.release_all();
                loop {
                    event.wait();
                    let mut generations = self.generations();
                    if generations.can_leave(my_generation) {
                        if generations.leave() {
                            event.reset();
                        }
                        break;
                    }
                    drop(generations);
                    // the event stays set for an older generation, let it drain
                    thread::yield_now();
                }
                depth
            }
        };

        mutex.relock(depth)
    }

    /// Block for as long as `condition` holds
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: RecursiveMutexGuard<'a, T>,
        mut condition: F,
    ) -> RecursiveMutexGuard<'a, T>
    where
        F: FnMut(&T) -> bool,
    {
        while condition(&*guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Release at most one blocked waiter
    pub fn signal(&self) {
        let mut generations = self.generations();
        if generations.signal() {
            self.wake(&generations);
        }
    }

    /// Release every blocked waiter
    pub fn broadcast(&self) {
        let mut generations = self.generations();
        if generations.broadcast() {
            self.wake(&generations);
        }
    }

    /// Number of threads blocked in `wait` that no signal has released yet
    pub fn waiter_count(&self) -> usize {
        let generations = self.generations();
        generations.waiters - generations.releases
    }

    // called with the counter lock held
    fn wake(&self, _generations: &MutexGuard<'_, Generations>) {
        match &self.wakeup {
            // only waiters of an older generation may leave, so wake them all and let them sort it out
            Wakeup::Native(condvar) => condvar.notify_all(),
            Wakeup::Event(event) => event.set(),
        }
    }

    fn generations(&self) -> MutexGuard<'_, Generations> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecursiveMutex;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const STRATEGIES: [WakeupStrategy; 2] = [WakeupStrategy::Native, WakeupStrategy::GenerationEvent];

    struct Shared {
        lock: RecursiveMutex<Cell<u32>>,
        cond: Condvar,
        woken: AtomicUsize,
    }

    fn spin_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn spawn_waiters(shared: &Arc<Shared>, count: usize) -> Vec<thread::JoinHandle<()>> {
        (0..count)
            .map(|_| {
                let shared = Arc::clone(shared);
                thread::spawn(move || {
                    let guard = shared.lock.lock();
                    let guard = shared.cond.wait(guard);
                    guard.set(guard.get() + 1);
                    shared.woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect()
    }

    fn shared(strategy: WakeupStrategy) -> Arc<Shared> {
        Arc::new(Shared {
            lock: RecursiveMutex::new(Cell::new(0)),
            cond: Condvar::with_strategy(strategy),
            woken: AtomicUsize::new(0),
        })
    }

    #[test]
    fn signal_releases_one_waiter_at_a_time() {
        for strategy in STRATEGIES {
            let shared = shared(strategy);
            let waiters = spawn_waiters(&shared, 2);
            spin_until("two waiters", || shared.cond.waiter_count() == 2);

            shared.cond.signal();
            spin_until("first wakeup", || shared.woken.load(Ordering::SeqCst) == 1);
            thread::sleep(Duration::from_millis(30));
            assert_eq!(shared.woken.load(Ordering::SeqCst), 1, "{strategy:?}");
            assert_eq!(shared.cond.waiter_count(), 1);

            shared.cond.signal();
            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert_eq!(shared.lock.lock().get(), 2);
        }
    }

    #[test]
    fn broadcast_releases_every_waiter() {
        for strategy in STRATEGIES {
            let shared = shared(strategy);
            let waiters = spawn_waiters(&shared, 4);
            spin_until("four waiters", || shared.cond.waiter_count() == 4);

            shared.cond.broadcast();
            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert_eq!(shared.woken.load(Ordering::SeqCst), 4, "{strategy:?}");
            assert_eq!(shared.cond.waiter_count(), 0);
        }
    }

    #[test]
    fn signal_without_waiters_is_not_remembered() {
        for strategy in STRATEGIES {
            let shared = shared(strategy);
            shared.cond.signal();
            shared.cond.broadcast();

            let waiters = spawn_waiters(&shared, 1);
            spin_until("one waiter", || shared.cond.waiter_count() == 1);
            thread::sleep(Duration::from_millis(30));
            assert_eq!(shared.woken.load(Ordering::SeqCst), 0, "{strategy:?}");

            shared.cond.signal();
            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert_eq!(shared.woken.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn wait_releases_every_recursion_level() {
        for strategy in STRATEGIES {
            let shared = shared(strategy);
            let waiter = {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let outer = shared.lock.lock();
                    let inner = shared.lock.lock();
                    let inner = shared.cond.wait_while(inner, |count| count.get() == 0);
                    assert!(shared.lock.is_owned_by_current_thread());
                    drop(inner);
                    assert!(shared.lock.is_owned_by_current_thread());
                    drop(outer);
                })
            };

            spin_until("waiter", || shared.cond.waiter_count() == 1);
            {
                // would deadlock if the waiter kept its outer level
                let guard = shared.lock.lock();
                guard.set(1);
                shared.cond.broadcast();
            }
            waiter.join().unwrap();
            assert!(!shared.lock.is_owned_by_current_thread());
        }
    }
}
