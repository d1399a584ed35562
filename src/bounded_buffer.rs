//! Bounded multi-producer/multi-consumer buffer guarded by three semaphores.

use std::{cell::UnsafeCell, fmt};

use log::debug;

use crate::semaphore::{Backend, Semaphore, MAX_VALUE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Record {
    pub producer: usize,
    pub value: i64,
}

impl Record {
    pub fn new(producer: usize, value: i64) -> Self {
        Self { producer, value }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.producer, self.value)
    }
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    input: usize,
    output: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            input: 0,
            output: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn put(&mut self, value: T) {
        assert!(self.len < self.capacity(), "put into a full ring");
        debug_assert!(self.slots[self.input].is_none());
        self.slots[self.input] = Some(value);
        self.input = (self.input + 1) % self.capacity();
        self.len += 1;
    }

    fn get(&mut self) -> T {
        assert!(self.len > 0, "get from an empty ring");
        let value = self.slots[self.output].take();
        self.output = (self.output + 1) % self.capacity();
        self.len -= 1;
        match value {
            Some(value) => value,
            None => unreachable!("occupied slot held no value"),
        }
    }

    fn occupied(&self) -> impl Iterator<Item = (usize, &T)> {
        (0..self.len).filter_map(move |offset| {
            let slot = (self.output + offset) % self.capacity();
            self.slots[slot].as_ref().map(|value| (slot, value))
        })
    }
}

pub struct BoundedBuffer<T> {
    capacity: usize,
    ring: UnsafeCell<Ring<T>>,
    mutex: Semaphore,
    filled: Semaphore,
    free: Semaphore,
}

// `ring` is only touched between mutex.wait() and mutex.signal().
unsafe impl<T> Sync for BoundedBuffer<T> where T: Send {}

impl<T> BoundedBuffer<T> {
    /// Creates an empty buffer with room for `capacity` items.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero or above [`MAX_VALUE`].
    pub fn new(capacity: usize) -> Self {
        Self::with_backend(capacity, Backend::native())
    }

    pub fn with_backend(capacity: usize, backend: Backend) -> Self {
        if capacity == 0 {
            panic!("cannot create a bounded buffer with capacity 0");
        }
        let free = match u32::try_from(capacity) {
            Ok(free) if free <= MAX_VALUE => free,
            _ => panic!("capacity {capacity} exceeds the semaphore maximum {MAX_VALUE}"),
        };
        Self {
            capacity,
            ring: UnsafeCell::new(Ring::new(capacity)),
            mutex: Semaphore::with_backend(backend, 1),
            filled: Semaphore::with_backend(backend, 0),
            free: Semaphore::with_backend(backend, free),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn put(&self, value: T) {
        self.free.wait();
        self.critical(|ring| ring.put(value));
        self.filled.signal();
    }

    pub fn get(&self) -> T {
        self.filled.wait();
        let value = self.critical(|ring| ring.get());
        self.free.signal();
        value
    }

    pub fn len(&self) -> usize {
        self.critical(|ring| ring.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn critical<R>(&self, f: impl FnOnce(&mut Ring<T>) -> R) -> R {
        self.mutex.wait();
        let result = f(unsafe { &mut *self.ring.get() });
        self.mutex.signal();
        result
    }
}

impl<T: Clone> BoundedBuffer<T> {
    pub fn snapshot(&self) -> Snapshot<T> {
        let snapshot = self.critical(|ring| Snapshot {
            capacity: ring.capacity(),
            input: ring.input,
            output: ring.output,
            items: ring
                .occupied()
                .map(|(slot, value)| (slot, value.clone()))
                .collect(),
        });
        debug!(
            "snapshot: {} of {} slots filled",
            snapshot.items.len(),
            snapshot.capacity
        );
        snapshot
    }
}

impl<T> fmt::Debug for BoundedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (input, output, len) = self.critical(|ring| (ring.input, ring.output, ring.len));
        f.debug_struct("BoundedBuffer")
            .field("capacity", &self.capacity)
            .field("in", &input)
            .field("out", &output)
            .field("len", &len)
            .finish()
    }
}

/// Point-in-time copy of a [`BoundedBuffer`]. The text layout is not stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot<T> {
    pub capacity: usize,
    pub input: usize,
    pub output: usize,
    pub items: Vec<(usize, T)>,
}

impl<T> Snapshot<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: fmt::Display> fmt::Display for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---- Bounded Buffer ----")?;
        writeln!(f)?;
        writeln!(f, "size: {}", self.capacity)?;
        writeln!(f, "  in: {}", self.input)?;
        writeln!(f, " out: {}", self.output)?;
        writeln!(f)?;
        for (slot, item) in &self.items {
            writeln!(f, "array[{slot}]: {item}")?;
        }
        writeln!(f)?;
        write!(f, "------------------------")
    }
}
