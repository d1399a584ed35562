//! Locks: a semaphore-built mutex that checks ownership, and a spin lock.

use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
    thread::{self, ThreadId},
};

use log::error;

use crate::semaphore::{Backend, Semaphore};

pub const MUTEX_SUCCESS: i32 = 0;
pub const MUTEX_ERROR_OWNER: i32 = -1;
pub const MUTEX_ERROR_COUNTER: i32 = -2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexError {
    Owner,
    Counter,
}

impl MutexError {
    pub const fn code(self) -> i32 {
        match self {
            MutexError::Owner => MUTEX_ERROR_OWNER,
            MutexError::Counter => MUTEX_ERROR_COUNTER,
        }
    }
}

impl fmt::Display for MutexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(error_to_string(self.code()))
    }
}

impl std::error::Error for MutexError {}

pub type LockResult = Result<(), MutexError>;

pub fn status_code(result: &LockResult) -> i32 {
    match result {
        Ok(()) => MUTEX_SUCCESS,
        Err(err) => err.code(),
    }
}

pub fn error_to_string(code: i32) -> &'static str {
    match code {
        MUTEX_SUCCESS => "SUCCESS",
        MUTEX_ERROR_OWNER => "OWNER",
        MUTEX_ERROR_COUNTER => "COUNTER",
        _ => "UNDEFINED",
    }
}

struct LockState {
    // 1 while unlocked, 0 while locked.
    counter: u8,
    owner: Option<ThreadId>,
}

pub struct Mutex {
    gate: Semaphore,
    state_guard: Semaphore,
    state: UnsafeCell<LockState>,
}

// `state` is only touched between state_guard.wait() and state_guard.signal().
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn new() -> Self {
        Self::with_backend(Backend::native())
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self {
            gate: Semaphore::with_backend(backend, 1),
            state_guard: Semaphore::with_backend(backend, 1),
            state: UnsafeCell::new(LockState {
                counter: 1,
                owner: None,
            }),
        }
    }

    // Not reentrant: a second lock from the owner deadlocks.
    pub fn lock(&self) -> LockResult {
        self.gate.wait();
        self.with_state(|state| {
            if state.counter != 1 {
                self.gate.signal();
                return Err(MutexError::Counter);
            }
            state.counter = 0;
            state.owner = Some(thread::current().id());
            Ok(())
        })
    }

    pub fn unlock(&self) -> LockResult {
        let me = thread::current().id();
        self.with_state(|state| {
            if state.owner != Some(me) {
                return Err(MutexError::Owner);
            }
            if state.counter != 0 {
                return Err(MutexError::Counter);
            }
            self.gate.signal();
            state.counter = 1;
            state.owner = None;
            Ok(())
        })
    }

    pub fn is_locked(&self) -> bool {
        self.with_state(|state| state.counter == 0)
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.with_state(|state| state.owner)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LockState) -> R) -> R {
        self.state_guard.wait();
        let result = f(unsafe { &mut *self.state.get() });
        self.state_guard.signal();
        result
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("owner", &self.owner())
            .finish()
    }
}

pub struct MutexCell<T> {
    mutex: Mutex,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for MutexCell<T> where T: Send {}

impl<T> MutexCell<T> {
    pub fn new(value: T) -> Self {
        Self::with_backend(Backend::native(), value)
    }

    pub fn with_backend(backend: Backend, value: T) -> Self {
        Self {
            mutex: Mutex::with_backend(backend),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>, MutexError> {
        self.mutex.lock()?;
        Ok(MutexGuard {
            cell: self,
            _not_send: PhantomData,
        })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

// !Send: only the locking thread may unlock.
pub struct MutexGuard<'a, T> {
    cell: &'a MutexCell<T>,
    _not_send: PhantomData<Rc<()>>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.cell.mutex.unlock() {
            error!("failed to unlock mutex guard: {err}");
        }
    }
}

pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc,
        },
        time::Duration,
    };

    use super::*;
    use crate::semaphore::usable_backends;

    #[test]
    fn test_error_strings() {
        assert_eq!(error_to_string(MUTEX_SUCCESS), "SUCCESS");
        assert_eq!(error_to_string(MUTEX_ERROR_OWNER), "OWNER");
        assert_eq!(error_to_string(MUTEX_ERROR_COUNTER), "COUNTER");
        assert_eq!(error_to_string(42), "UNDEFINED");
        assert_eq!(MutexError::Owner.to_string(), "OWNER");
        assert_eq!(status_code(&Ok(())), MUTEX_SUCCESS);
        assert_eq!(status_code(&Err(MutexError::Counter)), MUTEX_ERROR_COUNTER);
    }

    #[test]
    fn test_lock_unlock() {
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.lock(), Ok(()));
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(thread::current().id()));
        assert_eq!(mutex.unlock(), Ok(()));
        assert!(!mutex.is_locked());
        assert_eq!(mutex.owner(), None);
    }

    #[test]
    fn test_unlock_when_unlocked_is_owner_error() {
        let mutex = Mutex::new();
        assert_eq!(mutex.unlock(), Err(MutexError::Owner));
        assert!(!mutex.is_locked());
        assert_eq!(mutex.lock(), Ok(()));
        assert_eq!(mutex.unlock(), Ok(()));
    }

    #[test]
    fn test_unlock_by_other_thread_keeps_lock() {
        for backend in usable_backends() {
            let mutex = Arc::new(Mutex::with_backend(backend));
            let (release_tx, release_rx) = mpsc::channel::<()>();

            mutex.lock().unwrap();
            let owner = thread::current().id();

            let result = {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || mutex.unlock()).join().unwrap()
            };
            assert_eq!(result, Err(MutexError::Owner));
            assert!(mutex.is_locked());
            assert_eq!(mutex.owner(), Some(owner));

            let acquired = Arc::new(AtomicBool::new(false));
            let contender = {
                let mutex = Arc::clone(&mutex);
                let acquired = Arc::clone(&acquired);
                thread::spawn(move || {
                    mutex.lock().unwrap();
                    acquired.store(true, Ordering::SeqCst);
                    release_rx.recv().unwrap();
                    mutex.unlock().unwrap();
                })
            };

            thread::sleep(Duration::from_millis(100));
            assert!(!acquired.load(Ordering::SeqCst));

            mutex.unlock().unwrap();
            while !acquired.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            assert_ne!(mutex.owner(), Some(owner));
            release_tx.send(()).unwrap();
            contender.join().unwrap();
            assert!(!mutex.is_locked());
        }
    }

    #[test]
    fn test_racing_lockers_exclude_each_other() {
        let mutex = Mutex::new();
        let inside = AtomicUsize::new(0);
        let entered = AtomicUsize::new(0);
        let threads = 8;
        let rounds = 250;

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    for _ in 0..rounds {
                        mutex.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        entered.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mutex.unlock().unwrap();
                    }
                });
            }
        });

        assert_eq!(entered.load(Ordering::Relaxed), threads * rounds);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.owner(), None);
    }

    #[test]
    fn test_mutex_cell_counter() {
        let cell = MutexCell::new(0i64);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *cell.lock().unwrap() += 2;
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *cell.lock().unwrap() -= 1;
                    }
                });
            }
        });
        assert_eq!(cell.into_inner(), 6000);
    }

    #[test]
    fn test_lock_counter_error_leaves_state_unchanged() {
        let mutex = Mutex::new();
        mutex.with_state(|state| state.counter = 0);
        let before = (mutex.is_locked(), mutex.owner());

        assert_eq!(mutex.lock(), Err(MutexError::Counter));
        assert_eq!((mutex.is_locked(), mutex.owner()), before);

        mutex.with_state(|state| state.counter = 1);
        assert_eq!(mutex.lock(), Ok(()));
        assert_eq!(mutex.unlock(), Ok(()));
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_unlock_counter_error_keeps_lock_held() {
        let mutex = Mutex::new();
        mutex.lock().unwrap();
        mutex.with_state(|state| state.counter = 1);
        let me = Some(thread::current().id());

        assert_eq!(mutex.unlock(), Err(MutexError::Counter));
        assert_eq!(mutex.owner(), me);
        assert!(!mutex.is_locked());

        mutex.with_state(|state| state.counter = 0);
        assert_eq!(mutex.unlock(), Ok(()));
        assert!(!mutex.is_locked());
        assert_eq!(mutex.owner(), None);

        assert_eq!(mutex.lock(), Ok(()));
        assert_eq!(mutex.unlock(), Ok(()));
    }

    #[test]
    fn test_spin_lock_counter() {
        let lock = SpinLock::new(0i64);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *lock.lock() += 3;
                    }
                });
            }
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *lock.lock() -= 4;
                    }
                });
            }
        });
        assert_eq!(lock.into_inner(), 0);
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let mut cell = MutexCell::new(String::from("semaphore"));
        {
            let mut guard = cell.lock().unwrap();
            guard.push_str("s");
            assert!(cell.mutex.is_locked());
        }
        assert!(!cell.mutex.is_locked());
        assert_eq!(cell.get_mut().as_str(), "semaphores");
    }
}
