use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

// who holds the lock and how many times
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A recursive, non-fair mutual exclusion lock
///
/// The thread holding the lock may lock it again without deadlocking and
/// must drop one guard per acquisition. Guards only hand out `&T`, so
/// mutation goes through interior mutability (`Cell`, `RefCell`).
pub struct RecursiveMutex<T: ?Sized> {
    ownership: Mutex<Ownership>,
    released: Condvar,
    data: UnsafeCell<T>,
}

// only the owning thread can reach `data`, so `T: Send` is enough
unsafe impl<T: ?Sized + Send> Send for RecursiveMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for RecursiveMutex<T> {}

impl<T> RecursiveMutex<T> {
    pub const fn new(value: T) -> Self {
        RecursiveMutex {
            ownership: Mutex::new(Ownership {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RecursiveMutex<T> {
    /// Acquire the lock, blocking while another thread holds it
    ///
    /// Returns immediately if the current thread already owns the lock.
    pub fn lock(&self) -> RecursiveMutexGuard<'_, T> {
        self.acquire(1);
        RecursiveMutexGuard::new(self)
    }

    /// Acquire the lock only if it is free or already owned by this thread
    pub fn try_lock(&self) -> Option<RecursiveMutexGuard<'_, T>> {
        let me = thread::current().id();
        let mut ownership = self.ownership();
        match ownership.owner {
            Some(owner) if owner != me => None,
            _ => {
                ownership.owner = Some(me);
                ownership.depth += 1;
                drop(ownership);
                Some(RecursiveMutexGuard::new(self))
            }
        }
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.ownership().owner == Some(thread::current().id())
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn ownership(&self) -> MutexGuard<'_, Ownership> {
        // the bookkeeping is updated in single statements, a poisoned lock is still consistent
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, levels: usize) {
        let me = thread::current().id();
        let mut ownership = self.ownership();
        loop {
            match ownership.owner {
                None => {
                    ownership.owner = Some(me);
                    ownership.depth = levels;
                    return;
                }
                Some(owner) if owner == me => {
                    ownership.depth = ownership
                        .depth
                        .checked_add(levels)
                        .expect("recursive mutex lock count overflowed");
                    return;
                }
                Some(_) => {
                    ownership = self
                        .released
                        .wait(ownership)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn release(&self) {
        let mut ownership = self.ownership();
        assert_eq!(
            ownership.owner,
            Some(thread::current().id()),
            "recursive mutex released by a thread that does not own it"
        );
        ownership.depth -= 1;
        if ownership.depth == 0 {
            ownership.owner = None;
            drop(ownership);
            self.released.notify_one();
        }
    }

    // drop every recursion level held by the current thread, returns how many there were
    pub(crate) fn release_all(&self) -> usize {
        let mut ownership = self.ownership();
        assert_eq!(
            ownership.owner,
            Some(thread::current().id()),
            "condition variable wait on a recursive mutex the thread does not own"
        );
        let depth = std::mem::replace(&mut ownership.depth, 0);
        ownership.owner = None;
        drop(ownership);
        self.released.notify_one();
        depth
    }

    // take back `depth` levels released by `release_all`, yields the guard of the innermost level
    pub(crate) fn relock(&self, depth: usize) -> RecursiveMutexGuard<'_, T> {
        debug_assert!(depth > 0);
        self.acquire(depth);
        RecursiveMutexGuard::new(self)
    }
}

impl<T: Default> Default for RecursiveMutex<T> {
    fn default() -> Self {
        RecursiveMutex::new(T::default())
    }
}

/// One acquisition of a [`RecursiveMutex`], released on drop
pub struct RecursiveMutexGuard<'a, T: ?Sized> {
    mutex: &'a RecursiveMutex<T>,
    // a level must be released by the thread that took it
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> RecursiveMutexGuard<'a, T> {
    fn new(mutex: &'a RecursiveMutex<T>) -> Self {
        RecursiveMutexGuard {
            mutex,
            _not_send: PhantomData,
        }
    }

    // hand the level over to the caller without releasing it
    pub(crate) fn into_mutex(guard: Self) -> &'a RecursiveMutex<T> {
        let mutex = guard.mutex;
        std::mem::forget(guard);
        mutex
    }
}

impl<T: ?Sized> Deref for RecursiveMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for RecursiveMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn reentrant_lock_on_same_thread() {
        let mutex = RecursiveMutex::new(Cell::new(0));
        let outer = mutex.lock();
        outer.set(1);
        {
            let inner = mutex.lock();
            inner.set(inner.get() + 1);
            assert!(mutex.is_owned_by_current_thread());
        }
        assert_eq!(outer.get(), 2);
        drop(outer);
        assert!(!mutex.is_owned_by_current_thread());
    }

    #[test]
    fn other_threads_wait_for_the_last_release() {
        let mutex = Arc::new(RecursiveMutex::new(Cell::new(0u32)));
        let outer = mutex.lock();
        let inner = mutex.lock();

        let (tx, rx) = mpsc::channel();
        let contender = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || {
                assert!(mutex.try_lock().is_none());
                let guard = mutex.lock();
                tx.send(guard.get()).unwrap();
            })
        };

        drop(inner);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        outer.set(7);
        drop(outer);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        contender.join().unwrap();
    }

    #[test]
    fn release_all_and_relock_restore_depth() {
        let mutex = RecursiveMutex::new(());
        let outer = mutex.lock();
        let inner = mutex.lock();

        let raw = RecursiveMutexGuard::into_mutex(inner);
        assert_eq!(raw.release_all(), 2);
        assert!(!mutex.is_owned_by_current_thread());

        let inner = raw.relock(2);
        drop(inner);
        assert!(mutex.is_owned_by_current_thread());
        drop(outer);
        assert!(!mutex.is_owned_by_current_thread());
    }
}
