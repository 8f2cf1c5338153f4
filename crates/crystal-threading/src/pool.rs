//! General-purpose thread pool with cancellation and periodic work.
//!
//! Unlike the [`Dispatcher`](crate::Dispatcher), which fans a batch out and
//! waits for the drain, the pool is a fire-and-forget service: tasks are
//! queued, worker threads are spawned on demand up to a maximum, idle
//! workers are reaped after a timeout, and individual tasks can be
//! cancelled by ID. Periodic items are serviced by a dedicated timer
//! thread that exists only while periodic items are registered.
//!
//! # Example
//!
//! ```no_run
//! use crystal_threading::{ThreadPool, ThreadPoolConfig};
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::default());
//!
//! let id = pool.schedule(|token| {
//!     for chunk in 0..100 {
//!         if token.is_cancelled() {
//!             return;
//!         }
//!         // process chunk...
//!         let _ = chunk;
//!     }
//! });
//!
//! // Changed our mind: drop it if still queued, otherwise ask it to stop
//! // and wait until it has.
//! if let Some(id) = id {
//!     pool.cancel(id, true);
//! }
//!
//! pool.terminate();
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::error::{Error, Result};
use crate::logging::targets;
use crate::platform::{self, ThreadPriority};
use crate::signal::WakeSignal;

new_key_type! {
    /// Identifier of a task scheduled on a [`ThreadPool`].
    pub struct WorkId;

    /// Identifier of a periodic item registered on a [`ThreadPool`].
    pub struct PeriodicId;
}

/// How long `terminate()` and `reduce_threads()` wait for a worker before
/// leaking it.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum interval between unforced idle-reap sweeps.
const REDUCE_INTERVAL: Duration = Duration::from_secs(5);

/// A cancellation token for cooperative task cancellation.
///
/// Every pool task receives a reference to its token and should check it
/// periodically, returning early once cancellation has been requested.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Reset the token to the uncancelled state, allowing reuse.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

/// Configuration for creating a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Upper bound on worker threads. `None` means one per available CPU.
    pub max_threads: Option<usize>,
    /// Scheduling priority for worker and timer threads.
    pub priority: ThreadPriority,
    /// Name prefix for spawned threads.
    pub name: String,
    /// How long a worker may sit idle before `reduce_threads` reaps it.
    pub idle_timeout: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            priority: ThreadPriority::BelowNormal,
            name: "crystal-pool".to_string(),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ThreadPoolConfig {
    /// Create a configuration with the given worker-thread cap.
    pub fn with_max_threads(max_threads: usize) -> Self {
        Self {
            max_threads: Some(max_threads),
            ..Default::default()
        }
    }
}

type BoxedPoolTask = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;
type SharedPeriodicTask = Arc<Mutex<Box<dyn FnMut() + Send + 'static>>>;

/// A task sitting in the queue, not yet claimed by a worker.
struct QueuedWork {
    id: WorkId,
    token: CancellationToken,
    task: BoxedPoolTask,
}

/// Bookkeeping for a task between `schedule` and completion.
struct WorkMeta {
    token: CancellationToken,
    /// The worker currently running the task, once claimed.
    runner: Option<Arc<PoolWorker>>,
}

/// State a worker thread shares with the pool handle.
struct PoolWorker {
    signal: WakeSignal,
    exited: WakeSignal,
    should_exit: AtomicBool,
    /// Set once the thread function is actually running.
    started: AtomicBool,
    /// Whether the worker currently holds a claimed task.
    busy: AtomicBool,
    /// Idle since this instant, for the reaper.
    idle_since: Mutex<Option<Instant>>,
    /// Held for the duration of each task execution; locking it waits out
    /// the running task.
    work_lock: Mutex<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolWorker {
    fn new() -> Self {
        Self {
            signal: WakeSignal::new(),
            exited: WakeSignal::new(),
            should_exit: AtomicBool::new(false),
            started: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            idle_since: Mutex::new(Some(Instant::now())),
            work_lock: Mutex::new(()),
            handle: Mutex::new(None),
        }
    }

    /// Block until the currently running task (if any) has returned.
    fn wait_work_finished(&self) {
        let _finished = self.work_lock.lock();
    }

    /// Ask the thread to exit and join it, bounded.
    fn exit(&self, timeout: Duration) {
        self.should_exit.store(true, Ordering::Release);
        self.signal.signal();
        if self.exited.wait_timeout(timeout) {
            if let Some(handle) = self.handle.lock().take() {
                let _ = handle.join();
            }
        } else {
            tracing::warn!(
                target: targets::POOL,
                ?timeout,
                "pool worker did not exit in time, leaking it"
            );
            self.handle.lock().take();
        }
    }
}

/// Mutable pool state, guarded by one lock (queue and worker list move
/// together, as in `begin_work`/`end_work`).
struct PoolState {
    queue: VecDeque<QueuedWork>,
    meta: SlotMap<WorkId, WorkMeta>,
    workers: Vec<Arc<PoolWorker>>,
    spawned_total: usize,
    terminated: bool,
    last_reduce: Option<Instant>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_threads: usize,
    priority: ThreadPriority,
    name: String,
    idle_timeout: Duration,
    periodic: PeriodicRegistry,
}

impl PoolInner {
    /// Claim the next queued task for `worker`. Returns `None` when the
    /// queue is empty, in which case the worker goes idle.
    fn begin_work(&self, worker: &Arc<PoolWorker>) -> Option<QueuedWork> {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(work) => {
                if let Some(meta) = state.meta.get_mut(work.id) {
                    meta.runner = Some(worker.clone());
                }
                worker.busy.store(true, Ordering::Release);
                Some(work)
            }
            None => {
                *worker.idle_since.lock() = Some(Instant::now());
                None
            }
        }
    }

    /// Release the claim after the task has returned.
    fn end_work(&self, worker: &Arc<PoolWorker>, id: WorkId) {
        let mut state = self.state.lock();
        state.meta.remove(id);
        worker.busy.store(false, Ordering::Release);
        *worker.idle_since.lock() = Some(Instant::now());
    }

    /// Spawn one worker thread. Caller holds the state lock.
    fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) -> Result<Arc<PoolWorker>> {
        let worker = Arc::new(PoolWorker::new());
        let index = state.spawned_total;
        let name = format!("{}-{}", inner.name, index);

        let inner = inner.clone();
        let thread_worker = worker.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    worker_run(&inner, &thread_worker);
                }));
                if outcome.is_err() {
                    tracing::warn!(
                        target: targets::POOL,
                        "pool worker lost: scheduled task panicked"
                    );
                    // Remove ourselves so the pool can spawn a replacement.
                    let mut state = inner.state.lock();
                    state.workers.retain(|w| !Arc::ptr_eq(w, &thread_worker));
                }
                thread_worker.exited.signal();
            })
            .map_err(|source| Error::spawn(name, source))?;

        *worker.handle.lock() = Some(handle);
        state.spawned_total += 1;
        state.workers.push(worker.clone());
        Ok(worker)
    }
}

/// The worker thread loop: wait for a wakeup, then drain the queue until
/// it is empty or an exit was requested.
fn worker_run(inner: &Arc<PoolInner>, worker: &Arc<PoolWorker>) {
    platform::set_current_thread_priority(inner.priority);
    worker.started.store(true, Ordering::Release);

    loop {
        worker.signal.wait();
        if worker.should_exit.load(Ordering::Acquire) {
            break;
        }

        while !worker.should_exit.load(Ordering::Acquire) {
            let Some(QueuedWork { id, token, task }) = inner.begin_work(worker) else {
                break;
            };
            let outcome = {
                let _executing = worker.work_lock.lock();
                catch_unwind(AssertUnwindSafe(|| task(&token)))
            };
            // Release the claim even when the task panicked, so nobody
            // waits forever on a busy flag that would never clear.
            inner.end_work(worker, id);
            if let Err(payload) = outcome {
                std::panic::resume_unwind(payload);
            }
        }
    }
}

/// A dynamically sized pool of background worker threads.
///
/// Threads are spawned on demand when work arrives and no started worker
/// is free, up to `max_threads`; [`reduce_threads`](Self::reduce_threads)
/// reaps workers that have been idle past the configured timeout. Tasks
/// are cooperative: each receives a [`CancellationToken`] it is expected
/// to poll.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Create a pool. No threads are spawned until work arrives.
    pub fn new(config: ThreadPoolConfig) -> Self {
        let max_threads = config.max_threads.unwrap_or_else(platform::cpu_count).max(1);
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    meta: SlotMap::with_key(),
                    workers: Vec::new(),
                    spawned_total: 0,
                    terminated: false,
                    last_reduce: None,
                }),
                max_threads,
                priority: config.priority,
                name: config.name,
                idle_timeout: config.idle_timeout,
                periodic: PeriodicRegistry::new(config.priority),
            }),
        }
    }

    /// Upper bound on worker threads.
    pub fn max_thread_count(&self) -> usize {
        self.inner.max_threads
    }

    /// Number of worker threads currently alive.
    pub fn active_thread_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    /// Queue a task for execution on some worker thread.
    ///
    /// Wakes a free started worker if one exists; otherwise spawns a new
    /// worker when under the thread cap; otherwise signals every worker so
    /// the next one to finish grabs the task. Returns `None` (and drops
    /// the task) if the pool has been terminated.
    pub fn schedule<F>(&self, task: F) -> Option<WorkId>
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        debug_assert!(!state.terminated, "schedule() called after terminate()");
        if state.terminated {
            return None;
        }

        let token = CancellationToken::new();
        let id = state.meta.insert(WorkMeta {
            token: token.clone(),
            runner: None,
        });
        state.queue.push_back(QueuedWork {
            id,
            token,
            task: Box::new(task),
        });

        // Try to find a free worker first.
        for worker in &state.workers {
            if !worker.started.load(Ordering::Acquire) {
                // Thread did not even start yet; it will drain the queue
                // when it does.
                continue;
            }
            if !worker.busy.load(Ordering::Acquire) {
                worker.signal.signal();
                return Some(id);
            }
        }

        if state.workers.len() < self.inner.max_threads {
            // Spawn a new thread while the limit is not reached yet.
            match PoolInner::spawn_worker(&self.inner, &mut state) {
                Ok(worker) => worker.signal.signal(),
                Err(error) => {
                    tracing::warn!(
                        target: targets::POOL,
                        %error,
                        "could not grow pool, task stays queued"
                    );
                    for worker in &state.workers {
                        worker.signal.signal();
                    }
                }
            }
        } else {
            // Everyone is busy: the next worker to finish grabs the task.
            for worker in &state.workers {
                worker.signal.signal();
            }
        }
        Some(id)
    }

    /// Cancel a scheduled task.
    ///
    /// A task still sitting in the queue is removed and never executes.
    /// A task already running is only affected when `force` is set: its
    /// token is cancelled and the call blocks until the task function has
    /// returned. A task that already completed is a no-op.
    pub fn cancel(&self, id: WorkId, force: bool) {
        let mut state = self.inner.state.lock();
        if state.terminated {
            return;
        }

        if let Some(position) = state.queue.iter().position(|work| work.id == id) {
            state.queue.remove(position);
            state.meta.remove(id);
            return;
        }

        if force {
            if let Some(meta) = state.meta.get(id) {
                meta.token.cancel();
                if let Some(runner) = meta.runner.clone() {
                    // Wait outside the pool lock; the worker needs it to
                    // finish up.
                    drop(state);
                    runner.wait_work_finished();
                }
            }
        }
    }

    /// Cancel everything: drop all queued tasks, cancel all running tasks
    /// and wait until they have returned.
    pub fn cancel_all(&self) {
        let runners: Vec<Arc<PoolWorker>> = {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return;
            }
            let drained: Vec<_> = state.queue.drain(..).collect();
            for work in drained {
                state.meta.remove(work.id);
            }
            let mut runners = Vec::new();
            for (_, meta) in state.meta.iter() {
                meta.token.cancel();
                if let Some(runner) = meta.runner.clone() {
                    runners.push(runner);
                }
            }
            runners
        };
        for runner in runners {
            runner.wait_work_finished();
        }
    }

    /// Pre-spawn workers until at least `min_count` are alive.
    pub fn allocate_threads(&self, min_count: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.terminated {
            return Err(Error::Terminated);
        }
        let target = min_count.min(self.inner.max_threads);
        while state.workers.len() < target {
            PoolInner::spawn_worker(&self.inner, &mut state)?;
        }
        Ok(())
    }

    /// Reap workers that have been idle past the configured timeout.
    ///
    /// Unforced sweeps are rate-limited to one per five seconds and skip
    /// entirely while work is queued. A forced sweep reaps every currently
    /// idle worker immediately.
    pub fn reduce_threads(&self, force: bool) {
        let now = Instant::now();
        let reaped: Vec<Arc<PoolWorker>> = {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return;
            }
            if !force {
                if let Some(last) = state.last_reduce {
                    if now.duration_since(last) < REDUCE_INTERVAL {
                        return;
                    }
                }
            }
            state.last_reduce = Some(now);

            // Don't stop anything as long as there's work to do.
            if !force && !state.queue.is_empty() {
                return;
            }

            let idle_timeout = self.inner.idle_timeout;
            let mut reaped = Vec::new();
            state.workers.retain(|worker| {
                if worker.busy.load(Ordering::Acquire) {
                    return true;
                }
                let expired = match *worker.idle_since.lock() {
                    Some(since) => force || now.duration_since(since) >= idle_timeout,
                    None => force,
                };
                if expired {
                    reaped.push(worker.clone());
                }
                !expired
            });
            reaped
        };

        if !reaped.is_empty() {
            tracing::debug!(
                target: targets::POOL,
                count = reaped.len(),
                force,
                "reaping idle pool workers"
            );
        }
        for worker in reaped {
            worker.exit(WORKER_JOIN_TIMEOUT);
        }
    }

    /// Register a periodic item executed every `interval` on the pool's
    /// timer thread. The timer thread starts with the first item and stops
    /// with the last. Execution is due-time based, not drift-free.
    pub fn add_periodic<F>(&self, interval: Duration, task: F) -> PeriodicId
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.periodic.add(interval, Box::new(task))
    }

    /// Remove a periodic item. If it is the last one, the timer thread is
    /// stopped. An item currently executing finishes its current run.
    pub fn remove_periodic(&self, id: PeriodicId) {
        self.inner.periodic.remove(id);
    }

    /// Shut the pool down.
    ///
    /// Queued-but-unstarted tasks are dropped without executing. Running
    /// tasks have their tokens cancelled and are waited out, then every
    /// worker is exited (bounded join) and the timer thread is stopped.
    /// Idempotent; also invoked from `Drop`.
    pub fn terminate(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;

            let dropped = state.queue.len();
            let drained: Vec<_> = state.queue.drain(..).collect();
            for work in drained {
                state.meta.remove(work.id);
            }
            if dropped > 0 {
                tracing::debug!(
                    target: targets::POOL,
                    dropped,
                    "discarded queued tasks on terminate"
                );
            }
        }

        // Wait until no worker is mid-task any more. A worker can show
        // busy briefly after its task returned (until end_work runs), so
        // re-scan rather than trusting a single pass.
        loop {
            let busy_worker = {
                let state = self.inner.state.lock();
                state
                    .workers
                    .iter()
                    .find(|worker| worker.busy.load(Ordering::Acquire))
                    .cloned()
            };
            let Some(worker) = busy_worker else { break };
            {
                let state = self.inner.state.lock();
                for (_, meta) in state.meta.iter() {
                    meta.token.cancel();
                }
            }
            worker.wait_work_finished();
            thread::sleep(Duration::from_millis(10));
        }

        let workers = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.workers)
        };
        for worker in &workers {
            worker.exit(WORKER_JOIN_TIMEOUT);
        }

        self.inner.periodic.stop();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThreadPool")
            .field("max_threads", &self.inner.max_threads)
            .field("active_threads", &state.workers.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(ThreadPool: Send, Sync);

//------------------------------------------------------------------------
// Periodic items
//------------------------------------------------------------------------

struct PeriodicItem {
    next_run: Instant,
    interval: Duration,
    task: SharedPeriodicTask,
}

struct TimerHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic items plus the timer thread that services them.
struct PeriodicRegistry {
    items: Arc<Mutex<SlotMap<PeriodicId, PeriodicItem>>>,
    timer: Mutex<Option<TimerHandle>>,
    priority: ThreadPriority,
}

impl PeriodicRegistry {
    fn new(priority: ThreadPriority) -> Self {
        Self {
            items: Arc::new(Mutex::new(SlotMap::with_key())),
            timer: Mutex::new(None),
            priority,
        }
    }

    fn add(&self, interval: Duration, task: Box<dyn FnMut() + Send + 'static>) -> PeriodicId {
        let id = self.items.lock().insert(PeriodicItem {
            next_run: Instant::now() + interval,
            interval,
            task: Arc::new(Mutex::new(task)),
        });

        let mut timer = self.timer.lock();
        if timer.is_none() {
            *timer = Some(self.start_timer());
        }
        id
    }

    fn remove(&self, id: PeriodicId) {
        let now_empty = {
            let mut items = self.items.lock();
            items.remove(id);
            items.is_empty()
        };
        if now_empty {
            self.stop();
        }
    }

    fn start_timer(&self) -> TimerHandle {
        let (stop, stop_rx) = bounded::<()>(1);
        let items = self.items.clone();
        let priority = self.priority;
        let handle = thread::Builder::new()
            .name("crystal-pool-timer".to_string())
            .spawn(move || timer_run(&items, &stop_rx, priority))
            .expect("failed to spawn pool timer thread");
        tracing::trace!(target: targets::TIMER, "timer thread started");
        TimerHandle { stop, handle }
    }

    fn stop(&self) {
        let Some(timer) = self.timer.lock().take() else {
            return;
        };
        let _ = timer.stop.send(());
        // A periodic task removing itself runs on the timer thread; the
        // loop sees the stop request on its next tick, so just detach.
        if timer.handle.thread().id() == thread::current().id() {
            return;
        }
        let _ = timer.handle.join();
        tracing::trace!(target: targets::TIMER, "timer thread stopped");
    }
}

/// The timer thread loop: execute due items, then sleep out the remainder
/// of the tick (interruptible by the stop channel).
fn timer_run(
    items: &Mutex<SlotMap<PeriodicId, PeriodicItem>>,
    stop: &Receiver<()>,
    priority: ThreadPriority,
) {
    platform::set_current_thread_priority(priority);
    let tick = if priority < ThreadPriority::Normal {
        Duration::from_millis(250)
    } else {
        Duration::from_millis(100)
    };

    loop {
        let start = Instant::now();

        // Snapshot due tasks so they run without holding the registry
        // lock; a task may add or remove periodic items.
        let due: Vec<SharedPeriodicTask> = {
            let mut items = items.lock();
            let mut due = Vec::new();
            for (_, item) in items.iter_mut() {
                if item.next_run <= start {
                    due.push(item.task.clone());
                    item.next_run = start + item.interval;
                }
            }
            due
        };
        for task in due {
            let mut task = task.lock();
            (*task)();
        }

        let wait = tick
            .saturating_sub(start.elapsed())
            .max(Duration::from_millis(1));
        match stop.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(max_threads: usize) -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig::with_max_threads(max_threads))
    }

    /// Poll until `predicate` holds or the timeout elapses.
    fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn test_no_threads_until_work_arrives() {
        let pool = pool(4);
        assert_eq!(pool.active_thread_count(), 0);
        pool.terminate();
    }

    #[test]
    fn test_scheduled_tasks_execute() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            pool.schedule(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }
        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::Acquire) == 20
        }));
        pool.terminate();
    }

    #[test]
    fn test_thread_cap_is_respected() {
        let pool = pool(2);
        for _ in 0..10 {
            pool.schedule(|_| thread::sleep(Duration::from_millis(50)));
        }
        assert!(pool.active_thread_count() <= 2);
        pool.terminate();
    }

    #[test]
    fn test_allocate_threads_prespawns() {
        let pool = pool(4);
        pool.allocate_threads(3).unwrap();
        assert_eq!(pool.active_thread_count(), 3);
        pool.terminate();
    }

    #[test]
    fn test_allocate_after_terminate_fails() {
        let pool = pool(4);
        pool.terminate();
        assert!(matches!(pool.allocate_threads(1), Err(Error::Terminated)));
    }

    #[test]
    fn test_cancel_queued_task_never_runs() {
        let pool = pool(1);
        let blocker_started = Arc::new(AtomicBool::new(false));
        {
            let blocker_started = blocker_started.clone();
            pool.schedule(move |token| {
                blocker_started.store(true, Ordering::Release);
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }
        assert!(wait_until(Duration::from_secs(5), || {
            blocker_started.load(Ordering::Acquire)
        }));

        // The single worker is occupied; this one stays queued.
        let executed = Arc::new(AtomicBool::new(false));
        let id = {
            let executed = executed.clone();
            pool.schedule(move |_| {
                executed.store(true, Ordering::Release);
            })
            .unwrap()
        };
        pool.cancel(id, false);

        pool.terminate();
        assert!(!executed.load(Ordering::Acquire));
    }

    #[test]
    fn test_force_cancel_waits_for_running_task() {
        let pool = pool(1);
        let started = Arc::new(AtomicBool::new(false));
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let id = {
            let started = started.clone();
            let observed_cancel = observed_cancel.clone();
            pool.schedule(move |token| {
                started.store(true, Ordering::Release);
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                observed_cancel.store(true, Ordering::Release);
            })
            .unwrap()
        };
        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::Acquire)
        }));

        pool.cancel(id, true);
        // cancel(force) must not return before the task function has.
        assert!(observed_cancel.load(Ordering::Acquire));
        pool.terminate();
    }

    #[test]
    fn test_reduce_threads_reaps_idle_workers() {
        let pool = pool(3);
        pool.allocate_threads(3).unwrap();
        assert_eq!(pool.active_thread_count(), 3);

        pool.reduce_threads(true);
        assert_eq!(pool.active_thread_count(), 0);
        pool.terminate();
    }

    #[test]
    fn test_periodic_item_repeats_until_removed() {
        let pool = pool(1);
        let ticks = Arc::new(AtomicUsize::new(0));
        let id = {
            let ticks = ticks.clone();
            pool.add_periodic(Duration::from_millis(50), move || {
                ticks.fetch_add(1, Ordering::AcqRel);
            })
        };

        assert!(wait_until(Duration::from_secs(5), || {
            ticks.load(Ordering::Acquire) >= 2
        }));

        pool.remove_periodic(id);
        let after_removal = ticks.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(ticks.load(Ordering::Acquire), after_removal);
        pool.terminate();
    }

    #[test]
    fn test_terminate_drops_queued_tasks() {
        let pool = pool(1);
        let blocker_started = Arc::new(AtomicBool::new(false));
        {
            let blocker_started = blocker_started.clone();
            pool.schedule(move |token| {
                blocker_started.store(true, Ordering::Release);
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }
        assert!(wait_until(Duration::from_secs(5), || {
            blocker_started.load(Ordering::Acquire)
        }));

        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let executed = executed.clone();
            pool.schedule(move |_| {
                executed.fetch_add(1, Ordering::AcqRel);
            });
        }

        pool.terminate();
        assert_eq!(executed.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let pool = pool(2);
        pool.schedule(|_| {});
        pool.terminate();
        pool.terminate();
        assert_eq!(pool.active_thread_count(), 0);
    }

    #[test]
    fn test_panicked_task_does_not_poison_pool() {
        let pool = pool(2);
        pool.schedule(|_| panic!("bad task"));

        assert!(wait_until(Duration::from_secs(5), || {
            pool.active_thread_count() == 0
        }));

        // The pool recovers by spawning a fresh worker.
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            pool.schedule(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }
        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::Acquire) == 1
        }));
        pool.terminate();
    }
}
