use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Events collected by one thread and shipped by another.
///
/// Clones share the same queue. `push` and `drain` take one lock, so a drain
/// sees every event pushed before it and none is delivered twice.
pub struct EventQueue<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: T) {
        self.lock().push(event);
    }

    /// Takes everything queued so far, oldest first, leaving the queue empty
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A producer that panicked mid-push leaves a valid Vec behind
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
