//! Platform thread services: scheduling priority, CPU pinning, workgroups.
//!
//! These are thin wrappers over the OS scheduling facilities that the
//! dispatcher and pool apply to their own threads. They are advisory: a
//! request the OS refuses (insufficient privileges, fewer CPUs than
//! requested) is reported by the boolean return value and otherwise ignored.

use std::fmt;
use std::sync::Arc;

use crate::logging::targets;

/// Scheduling priority for framework threads.
///
/// The variants map onto the native priority ladder of each platform:
/// Win32 thread priorities on Windows, QoS classes on macOS, and nice
/// values elsewhere on Unix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ThreadPriority {
    /// Only runs when the system is otherwise idle.
    Idle,
    /// Background maintenance work.
    Low,
    /// Below-normal work that should yield to interactive threads.
    BelowNormal,
    /// Default scheduling.
    #[default]
    Normal,
    /// Slightly favored over normal threads.
    AboveNormal,
    /// Time-sensitive processing.
    High,
    /// Latency-critical processing. Use sparingly.
    TimeCritical,
}

/// Apply a scheduling priority to the calling thread.
///
/// Returns `true` if the platform accepted the request.
pub fn set_current_thread_priority(priority: ThreadPriority) -> bool {
    let applied = apply_priority(priority);
    if !applied {
        tracing::debug!(
            target: targets::CORE,
            ?priority,
            "platform refused thread priority request"
        );
    }
    applied
}

#[cfg(windows)]
fn apply_priority(priority: ThreadPriority) -> bool {
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
        THREAD_PRIORITY_BELOW_NORMAL, THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_IDLE,
        THREAD_PRIORITY_LOWEST, THREAD_PRIORITY_NORMAL, THREAD_PRIORITY_TIME_CRITICAL,
    };

    let native = match priority {
        ThreadPriority::Idle => THREAD_PRIORITY_IDLE,
        ThreadPriority::Low => THREAD_PRIORITY_LOWEST,
        ThreadPriority::BelowNormal => THREAD_PRIORITY_BELOW_NORMAL,
        ThreadPriority::Normal => THREAD_PRIORITY_NORMAL,
        ThreadPriority::AboveNormal => THREAD_PRIORITY_ABOVE_NORMAL,
        ThreadPriority::High => THREAD_PRIORITY_HIGHEST,
        ThreadPriority::TimeCritical => THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe { SetThreadPriority(GetCurrentThread(), native).is_ok() }
}

#[cfg(target_os = "macos")]
fn apply_priority(priority: ThreadPriority) -> bool {
    use libc::qos_class_t;

    let qos = match priority {
        ThreadPriority::Idle | ThreadPriority::Low => qos_class_t::QOS_CLASS_BACKGROUND,
        ThreadPriority::BelowNormal => qos_class_t::QOS_CLASS_UTILITY,
        ThreadPriority::Normal => qos_class_t::QOS_CLASS_DEFAULT,
        ThreadPriority::AboveNormal => qos_class_t::QOS_CLASS_USER_INITIATED,
        ThreadPriority::High | ThreadPriority::TimeCritical => {
            qos_class_t::QOS_CLASS_USER_INTERACTIVE
        }
    };
    unsafe { libc::pthread_set_qos_class_self_np(qos, 0) == 0 }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn apply_priority(priority: ThreadPriority) -> bool {
    let nice = match priority {
        ThreadPriority::Idle => 19,
        ThreadPriority::Low => 10,
        ThreadPriority::BelowNormal => 5,
        ThreadPriority::Normal => 0,
        ThreadPriority::AboveNormal => -5,
        ThreadPriority::High => -10,
        ThreadPriority::TimeCritical => -15,
    };
    // `who = 0` addresses the calling thread on Linux.
    unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, nice) == 0 }
}

#[cfg(not(any(unix, windows)))]
fn apply_priority(_priority: ThreadPriority) -> bool {
    false
}

/// Pin the calling thread to the CPU with the given index.
///
/// Returns `true` if a matching core exists and the pin was applied.
pub fn pin_current_thread(cpu_index: usize) -> bool {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if cpu_index < core_ids.len() {
            return core_affinity::set_for_current(core_ids[cpu_index]);
        }
    }
    tracing::debug!(
        target: targets::CORE,
        cpu_index,
        "no CPU available for affinity request"
    );
    false
}

/// Number of CPUs available to this process.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// An opaque platform thread-grouping handle.
///
/// Some platforms group realtime audio/media threads so the kernel can
/// schedule them together. The threading core treats the mechanism as a
/// pass-through: workers join the group for the duration of their run loop
/// and leave it on exit. When a workgroup is configured on a
/// [`Dispatcher`](crate::Dispatcher), explicit CPU pinning is disabled
/// because the platform's grouping takes precedence.
pub trait Workgroup: Send + Sync {
    /// Attach the calling thread to the group.
    fn join(&self);
    /// Detach the calling thread from the group.
    fn leave(&self);
}

/// RAII scope for workgroup membership of the calling thread.
pub struct WorkgroupGuard {
    workgroup: Arc<dyn Workgroup>,
}

impl WorkgroupGuard {
    /// Join the workgroup; membership lasts until the guard is dropped.
    pub fn enter(workgroup: Arc<dyn Workgroup>) -> Self {
        workgroup.join();
        Self { workgroup }
    }
}

impl Drop for WorkgroupGuard {
    fn drop(&mut self) {
        self.workgroup.leave();
    }
}

impl fmt::Debug for WorkgroupGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkgroupGuard").finish_non_exhaustive()
    }
}
