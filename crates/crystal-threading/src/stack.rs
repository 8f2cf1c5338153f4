//! Lock-free work stack.

use crossbeam_queue::SegQueue;

/// A lock-free multi-producer/multi-consumer collection of pending items.
///
/// This wraps the external lock-free queue primitive behind the narrow
/// contract the dispatcher relies on: concurrent `push`/`pop` without
/// external locking, a `depth` that is only ever a hint for how many idle
/// workers to wake (never a completion signal), and `flush` for discarding
/// whatever is still queued at shutdown. Pop order is unspecified; workers
/// race for items.
#[derive(Debug, Default)]
pub struct WorkStack<T> {
    inner: SegQueue<T>,
}

impl<T> WorkStack<T> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Add an item. Never blocks, never fails.
    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    /// Remove some item, or `None` if the stack is observed empty.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Approximate number of pending items.
    pub fn depth(&self) -> usize {
        self.inner.len()
    }

    /// Whether the stack is observed empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Discard all queued items without handing them out.
    ///
    /// Returns the number of items discarded.
    pub fn flush(&self) -> usize {
        let mut discarded = 0;
        while self.inner.pop().is_some() {
            discarded += 1;
        }
        discarded
    }
}
