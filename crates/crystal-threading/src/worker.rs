//! Dispatcher worker threads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatcher::{DispatchShared, DrainPass};
use crate::error::{Error, Result};
use crate::logging::targets;
use crate::platform::{self, ThreadPriority, WorkgroupGuard};
use crate::signal::WakeSignal;

/// Error bits accumulated from abnormal worker termination, as reported by
/// [`Dispatcher::thread_errors`](crate::Dispatcher::thread_errors).
pub mod thread_errors {
    /// A work item panicked; the worker thread is lost for the remainder of
    /// the dispatcher's lifetime.
    pub const WORK_PANICKED: u32 = 1 << 0;
    /// A worker did not exit within the bounded join timeout during
    /// termination and was leaked.
    pub const JOIN_TIMED_OUT: u32 = 1 << 1;
}

/// One long-lived worker thread owned by the dispatcher.
pub(crate) struct WorkerThread {
    signal: Arc<WakeSignal>,
    exited: Arc<WakeSignal>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn a worker. The thread immediately registers itself available
    /// and blocks until woken.
    pub(crate) fn spawn(
        index: usize,
        name_prefix: &str,
        cpu_index: Option<usize>,
        priority: ThreadPriority,
        shared: Arc<DispatchShared>,
    ) -> Result<Self> {
        let signal = Arc::new(WakeSignal::new());
        let exited = Arc::new(WakeSignal::new());
        let name = format!("{name_prefix}-{index}");

        let thread_signal = signal.clone();
        let thread_exited = exited.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_loop(&shared, &thread_signal, cpu_index, priority);
                }));
                if outcome.is_err() {
                    shared
                        .thread_errors
                        .fetch_or(thread_errors::WORK_PANICKED, Ordering::AcqRel);
                    tracing::warn!(
                        target: targets::WORKER,
                        "worker thread lost: work item panicked"
                    );
                }
                thread_exited.signal();
            })
            .map_err(|source| Error::spawn(name, source))?;

        Ok(Self {
            signal,
            exited,
            handle: Some(handle),
        })
    }

    /// Wake the worker so it re-examines the shared state.
    pub(crate) fn signal(&self) {
        self.signal.signal();
    }

    /// Wait for the worker to finish, bounded by `timeout`.
    ///
    /// The caller must already have set the shared done flag and signaled
    /// the worker. Returns the error bits to accumulate: zero on a clean
    /// exit, [`thread_errors::JOIN_TIMED_OUT`] when the thread is leaked.
    pub(crate) fn join_timeout(&mut self, timeout: Duration) -> u32 {
        if self.exited.wait_timeout(timeout) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            0
        } else {
            tracing::warn!(
                target: targets::WORKER,
                ?timeout,
                "worker thread did not exit in time, leaking it"
            );
            self.handle.take();
            thread_errors::JOIN_TIMED_OUT
        }
    }
}

/// The worker run loop.
///
/// Order matters here: availability is published *before* blocking on the
/// wakeup signal, so a push-and-signal racing against a worker that just
/// finished either sees it available and wakes it, or the worker consumes
/// the pending signal on its next iteration. The cycle-ended guard keeps a
/// late-woken worker from draining items that belong to the next batch
/// while the master is still finalizing the current one.
fn run_loop(
    shared: &DispatchShared,
    signal: &Arc<WakeSignal>,
    cpu_index: Option<usize>,
    priority: ThreadPriority,
) {
    if let Some(cpu) = cpu_index {
        platform::pin_current_thread(cpu);
    }
    platform::set_current_thread_priority(priority);
    let _membership = shared.workgroup.clone().map(WorkgroupGuard::enter);

    loop {
        shared.available.push(signal.clone());
        signal.wait();

        if shared.done.load(Ordering::Acquire) {
            break;
        }
        if shared.cycle_ended.load(Ordering::Acquire) {
            continue;
        }

        let _pass = DrainPass::enter(&shared.working);
        while let Some(item) = shared.queue.pop() {
            item.work();
            shared.finished.fetch_add(1, Ordering::AcqRel);
        }
    }
}
