//! Multi-worker dispatcher: fan work out, wait for drain.
//!
//! The dispatcher owns a fixed set of long-lived worker threads and a
//! lock-free stack of pending work. The thread that calls [`work`]
//! (the *master*) drains the stack itself while waking idle workers to
//! drain concurrently, then waits until every pushed item has finished.
//! This is deliberately a simple, fixed-topology primitive: no task graph,
//! no futures, no priorities — work items race for pop order and the only
//! guarantee is that each one executes exactly once per push.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use crystal_threading::{Dispatcher, DispatcherConfig};
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::with_threads(4)).unwrap();
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..1000 {
//!     let counter = counter.clone();
//!     dispatcher.push(Arc::new(move || {
//!         counter.fetch_add(1, Ordering::AcqRel);
//!     }));
//! }
//!
//! // Blocks until all 1000 items have run, on this thread and the workers.
//! let finished = dispatcher.work();
//! assert_eq!(finished, 1000);
//! assert_eq!(counter.load(Ordering::Acquire), 1000);
//!
//! dispatcher.terminate();
//! ```
//!
//! [`work`]: Dispatcher::work

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::error::Result;
use crate::logging::targets;
use crate::platform::{self, ThreadPriority, Workgroup};
use crate::signal::WakeSignal;
use crate::stack::WorkStack;
use crate::work::Work;
use crate::worker::WorkerThread;

/// How long `terminate()` waits for each worker before leaking it.
/// Generous in debug builds, where a work item under a debugger can stall
/// for a long time.
const JOIN_TIMEOUT: Duration = if cfg!(debug_assertions) {
    Duration::from_secs(120)
} else {
    Duration::from_secs(5)
};

/// Configuration for creating a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Total worker count *including* the master thread. The dispatcher
    /// spawns `max(0, num_threads - 1)` threads; the caller of
    /// [`Dispatcher::work`] is always the remaining one. `None` means one
    /// worker per available CPU.
    pub num_threads: Option<usize>,
    /// First CPU index to pin to when `use_cpu_affinity` is set.
    pub cpu_offset: usize,
    /// Scheduling priority applied to each worker thread.
    pub priority: ThreadPriority,
    /// Pin each worker to a distinct CPU starting at `cpu_offset`.
    /// Ignored when a workgroup is configured.
    pub use_cpu_affinity: bool,
    /// Name prefix for spawned threads, for diagnostics.
    pub name: Option<String>,
    /// Opaque platform thread-grouping handle. When set, workers join the
    /// group for the duration of their run loop and explicit CPU pinning
    /// is disabled: the platform's grouping takes precedence.
    pub workgroup: Option<Arc<dyn Workgroup>>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            cpu_offset: 0,
            priority: ThreadPriority::High,
            use_cpu_affinity: false,
            name: None,
            workgroup: None,
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration with the given total thread count.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("num_threads", &self.num_threads)
            .field("cpu_offset", &self.cpu_offset)
            .field("priority", &self.priority)
            .field("use_cpu_affinity", &self.use_cpu_affinity)
            .field("name", &self.name)
            .field("workgroup", &self.workgroup.as_ref().map(|_| ".."))
            .finish()
    }
}

/// State shared between the master and the worker threads.
pub(crate) struct DispatchShared {
    /// Pending work items.
    pub(crate) queue: WorkStack<Arc<dyn Work>>,
    /// Wakeup handles of workers that are idle and about to block.
    pub(crate) available: WorkStack<Arc<WakeSignal>>,
    /// Set once by `terminate()`; workers exit their loop when they see it.
    pub(crate) done: AtomicBool,
    /// True between cycles; keeps late-woken workers out of the next batch.
    pub(crate) cycle_ended: AtomicBool,
    /// Threads currently inside a drain pass. Zero is half of the cycle
    /// exit condition; queue depth alone is not enough, because a thread
    /// may have popped the last item and not yet finished running it.
    pub(crate) working: CachePadded<AtomicUsize>,
    /// Items finished during the current cycle.
    pub(crate) finished: CachePadded<AtomicUsize>,
    /// Accumulated per-worker error bits.
    pub(crate) thread_errors: AtomicU32,
    /// Optional platform thread-grouping handle, joined by each worker.
    pub(crate) workgroup: Option<Arc<dyn Workgroup>>,
}

impl DispatchShared {
    fn new(workgroup: Option<Arc<dyn Workgroup>>) -> Self {
        Self {
            queue: WorkStack::new(),
            available: WorkStack::new(),
            done: AtomicBool::new(false),
            cycle_ended: AtomicBool::new(false),
            working: CachePadded::new(AtomicUsize::new(0)),
            finished: CachePadded::new(AtomicUsize::new(0)),
            thread_errors: AtomicU32::new(0),
            workgroup,
        }
    }

    /// Wake up to `count` idle workers.
    pub(crate) fn wake_idle(&self, count: usize) {
        for _ in 0..count {
            match self.available.pop() {
                Some(signal) => signal.signal(),
                None => break,
            }
        }
    }
}

/// RAII bracket around one drain pass.
///
/// The counter must be incremented before the first pop of a pass and
/// released even if a work item panics, otherwise `work()` would wait on a
/// count that can never reach zero.
pub(crate) struct DrainPass<'a> {
    working: &'a AtomicUsize,
}

impl<'a> DrainPass<'a> {
    pub(crate) fn enter(working: &'a AtomicUsize) -> Self {
        working.fetch_add(1, Ordering::AcqRel);
        Self { working }
    }
}

impl Drop for DrainPass<'_> {
    fn drop(&mut self) {
        self.working.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A fixed-topology multi-threaded work dispatcher.
///
/// Constructed with a total thread count `N`; spawns `N - 1` worker
/// threads, with the calling thread acting as the Nth worker whenever it
/// is inside [`work`](Self::work). Work items are caller-owned
/// (`Arc<dyn Work>`): the dispatcher holds a reference only while an item
/// is queued or executing.
///
/// Exactly one thread at a time may drive [`work`](Self::work); the
/// dispatcher is otherwise freely shared between threads for
/// [`push`](Self::push) and [`push_and_signal`](Self::push_and_signal).
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    workers: Mutex<Vec<WorkerThread>>,
    num_threads: usize,
    master_cpu: Option<usize>,
}

impl Dispatcher {
    /// Create a dispatcher and spawn its worker threads.
    ///
    /// Workers start waiting for work immediately. Fails only if a native
    /// thread cannot be spawned; partially spawned workers are shut down
    /// again before the error is returned.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let num_threads = config.num_threads.unwrap_or_else(platform::cpu_count);
        let name = config.name.as_deref().unwrap_or("crystal-dispatch");
        // The platform's grouping mechanism takes precedence over pinning.
        let use_affinity = config.use_cpu_affinity && config.workgroup.is_none();

        let shared = Arc::new(DispatchShared::new(config.workgroup));
        let worker_count = num_threads.saturating_sub(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let cpu_index = use_affinity.then(|| config.cpu_offset + 1 + index);
            match WorkerThread::spawn(index, name, cpu_index, config.priority, shared.clone()) {
                Ok(worker) => workers.push(worker),
                Err(error) => {
                    shared.done.store(true, Ordering::Release);
                    for worker in &workers {
                        worker.signal();
                    }
                    return Err(error);
                }
            }
        }

        tracing::debug!(
            target: targets::DISPATCHER,
            workers = worker_count,
            name,
            "dispatcher ready"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            num_threads,
            master_cpu: use_affinity.then_some(config.cpu_offset),
        })
    }

    /// Total worker count, including the master.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Number of worker threads actually spawned (`num_threads - 1`,
    /// floored at zero).
    pub fn spawned_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// One-time CPU pinning for the calling (master) thread.
    ///
    /// Call once, from the thread that will drive [`work`](Self::work),
    /// before the first cycle. Does nothing unless the configuration
    /// requested CPU affinity.
    pub fn first_run(&self) {
        if let Some(cpu) = self.master_cpu {
            platform::pin_current_thread(cpu);
        }
    }

    /// Enqueue a work item without waking anyone.
    ///
    /// Never blocks. No ordering guarantee versus other pushes or pops.
    /// The item runs during a later [`work`](Self::work) cycle (or when an
    /// already-awake worker happens to drain it).
    pub fn push(&self, item: Arc<dyn Work>) {
        debug_assert!(
            !self.shared.done.load(Ordering::Acquire),
            "push() called after terminate()"
        );
        if self.shared.done.load(Ordering::Acquire) {
            return;
        }
        self.shared.queue.push(item);
    }

    /// Enqueue a work item and wake one idle worker.
    ///
    /// With `fail_when_all_busy` set, the call refuses when no worker is
    /// currently registered idle: it returns `false` and the item is *not*
    /// enqueued. This gives callers admission control instead of unbounded
    /// queuing. The availability check races against workers that are
    /// mid-transition between draining and idle, so it is best-effort, not
    /// a hard real-time guarantee.
    pub fn push_and_signal(&self, item: Arc<dyn Work>, fail_when_all_busy: bool) -> bool {
        debug_assert!(
            !self.shared.done.load(Ordering::Acquire),
            "push_and_signal() called after terminate()"
        );
        if self.shared.done.load(Ordering::Acquire) {
            return false;
        }
        if fail_when_all_busy && self.shared.available.is_empty() {
            return false;
        }
        self.shared.queue.push(item);
        self.shared.wake_idle(1);
        true
    }

    /// Drain all pushed work, blocking until every item has finished.
    ///
    /// The calling thread participates: it pops and executes items itself,
    /// waking idle workers (up to the remaining queue depth) before each
    /// item it runs so that draining proceeds in parallel. Returns only
    /// when the queue is empty *and* no thread is still inside a drain
    /// pass — depth alone is not a completion signal, because a worker may
    /// have popped the last item and not yet finished it, and a running
    /// item may push follow-up work.
    ///
    /// Returns the number of items finished during this call (by any
    /// thread). A call with nothing pending returns 0 without blocking.
    pub fn work(&self) -> usize {
        debug_assert!(
            !self.shared.done.load(Ordering::Acquire),
            "work() called after terminate()"
        );
        if self.shared.done.load(Ordering::Acquire) {
            return 0;
        }

        let shared = &*self.shared;
        shared.finished.store(0, Ordering::Release);
        shared.cycle_ended.store(false, Ordering::Release);

        let backoff = Backoff::new();
        loop {
            if shared.queue.depth() > 0 {
                let _pass = DrainPass::enter(&shared.working);
                while let Some(item) = shared.queue.pop() {
                    let pending = shared.queue.depth();
                    if pending > 0 {
                        shared.wake_idle(pending);
                    }
                    item.work();
                    shared.finished.fetch_add(1, Ordering::AcqRel);
                }
                backoff.reset();
            }

            if shared.working.load(Ordering::Acquire) > 0 {
                // A short tail: someone popped an item and is still running
                // it, and it may push follow-up work. Spin rather than
                // block.
                backoff.snooze();
            } else if shared.queue.is_empty() {
                break;
            }
        }

        shared.cycle_ended.store(true, Ordering::Release);
        shared.finished.load(Ordering::Acquire)
    }

    /// Shut the dispatcher down.
    ///
    /// Queued-but-unstarted items are discarded without executing.
    /// Already-running items finish naturally; each worker is then joined
    /// with a bounded timeout and leaked (with an error bit recorded) if
    /// it does not exit in time. Idempotent; also invoked from `Drop`.
    pub fn terminate(&self) {
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }

        let dropped = self.shared.queue.flush();
        if dropped > 0 {
            tracing::debug!(
                target: targets::DISPATCHER,
                dropped,
                "discarded queued work on terminate"
            );
        }

        let mut workers = self.workers.lock();
        for worker in workers.iter() {
            worker.signal();
        }
        for worker in workers.iter_mut() {
            let bits = worker.join_timeout(JOIN_TIMEOUT);
            if bits != 0 {
                self.shared.thread_errors.fetch_or(bits, Ordering::AcqRel);
            }
        }
        workers.clear();
        self.shared.available.flush();
    }

    /// Bitwise OR of per-worker error flags accumulated from abnormal
    /// thread termination. Advisory only; see [`thread_errors`].
    ///
    /// [`thread_errors`]: crate::thread_errors
    pub fn thread_errors(&self) -> u32 {
        self.shared.thread_errors.load(Ordering::Acquire)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("num_threads", &self.num_threads)
            .field("pending", &self.shared.queue.depth())
            .field("thread_errors", &self.thread_errors())
            .finish()
    }
}

static_assertions::assert_impl_all!(Dispatcher: Send, Sync);
