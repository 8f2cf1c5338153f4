//! The unit of work consumed by the dispatcher.

/// A single, indivisible, synchronous unit of work.
///
/// Work items are owned by the caller: the dispatcher holds a reference
/// only while the item is queued and executing, and never frees or reuses
/// it. An item must stay valid and must not be mutated by its owner from
/// the moment it is pushed until the dispatcher signals completion
/// ([`Dispatcher::work`](crate::Dispatcher::work) returning, or the
/// failure-fast [`push_and_signal`](crate::Dispatcher::push_and_signal)
/// path executing it).
///
/// `work()` runs on whichever thread pops the item first — the master or
/// any worker — so implementations must be safe to call from any of them.
/// Whatever external state `work()` touches is the implementation's own
/// concurrency responsibility; the dispatcher serializes nothing.
pub trait Work: Send + Sync {
    /// Execute the unit. Invoked exactly once per push.
    fn work(&self);
}

/// Any shareable closure is a work item.
impl<F> Work for F
where
    F: Fn() + Send + Sync,
{
    fn work(&self) {
        self()
    }
}
