use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug)]
enum Slot<T> {
    Empty,
    Full(T),
    Taken,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// One-shot value slot shared between a producer and a waiting consumer.
///
/// Only the first `fulfil` is stored, the value can be taken exactly once.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Empty),
                ready: Condvar::new(),
            }),
        }
    }

    /// store `value`, returns false if the promise was already fulfilled
    pub fn fulfil(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock();

        match *slot {
            Slot::Empty => {
                *slot = Slot::Full(value);
                self.inner.ready.notify_all();

                true
            }
            Slot::Full(_) | Slot::Taken => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Empty)
    }

    /// take the value if it is available, never blocks
    pub fn try_take(&self) -> Option<T> {
        let mut slot = self.inner.slot.lock();

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Full(value) => Some(value),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Block until the value is available and take it.
    /// Returns `None` if the value was already taken by another clone.
    pub fn wait(&self) -> Option<T> {
        let mut slot = self.inner.slot.lock();

        while matches!(*slot, Slot::Empty) {
            self.inner.ready.wait(&mut slot);
        }

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Full(value) => Some(value),
            _ => None,
        }
    }

    /// like `wait` but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();

        while matches!(*slot, Slot::Empty) {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Full(value) => Some(value),
            Slot::Empty => {
                *slot = Slot::Empty;
                None
            }
            Slot::Taken => None,
        }
    }
}
