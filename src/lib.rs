//! Thread synchronization built up from counting semaphores: the semaphore
//! itself, an ownership-checking mutex, and a bounded producer/consumer
//! buffer.

pub mod bounded_buffer;
pub mod logger;
pub mod mutex;
pub mod semaphore;

pub use bounded_buffer::{BoundedBuffer, Record, Snapshot};
pub use mutex::{
    error_to_string, LockResult, Mutex, MutexCell, MutexError, MutexGuard, SpinLock, SpinLockGuard,
};
pub use semaphore::{Backend, RawSemaphore, Semaphore};
