//! Threading core for the Crystal framework.
//!
//! This crate provides the framework's thread-level building blocks:
//!
//! - **Dispatcher**: fixed-topology multi-worker dispatch — fan a batch of
//!   work out over a lock-free stack and block until it has drained, with
//!   the calling thread participating as a worker
//! - **Thread Pool**: dynamically sized background pool with on-demand
//!   spawning, cooperative cancellation by work ID, and idle-thread reaping
//! - **Periodic Work**: pool-managed periodic items serviced by a timer
//!   thread
//! - **Platform Services**: scheduling priority, CPU pinning, and opaque
//!   workgroup membership for worker threads
//!
//! # Dispatcher Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use crystal_threading::{Dispatcher, DispatcherConfig};
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::with_threads(4))?;
//!
//! let processed = Arc::new(AtomicUsize::new(0));
//! for _ in 0..128 {
//!     let processed = processed.clone();
//!     dispatcher.push(Arc::new(move || {
//!         processed.fetch_add(1, Ordering::AcqRel);
//!     }));
//! }
//!
//! // The calling thread drains alongside the workers.
//! assert_eq!(dispatcher.work(), 128);
//!
//! dispatcher.terminate();
//! # Ok::<(), crystal_threading::Error>(())
//! ```
//!
//! # Thread Pool Example
//!
//! ```no_run
//! use std::time::Duration;
//! use crystal_threading::{ThreadPool, ThreadPoolConfig};
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::default());
//!
//! pool.schedule(|token| {
//!     while !token.is_cancelled() {
//!         // chew on something...
//!         # break;
//!     }
//! });
//!
//! let heartbeat = pool.add_periodic(Duration::from_secs(1), || {
//!     // runs on the pool's timer thread once a second
//! });
//!
//! pool.remove_periodic(heartbeat);
//! pool.terminate();
//! ```

mod dispatcher;
mod error;
pub mod logging;
pub mod platform;
mod pool;
mod signal;
mod stack;
mod work;
mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{Error, Result};
pub use platform::{ThreadPriority, Workgroup, WorkgroupGuard};
pub use pool::{CancellationToken, PeriodicId, ThreadPool, ThreadPoolConfig, WorkId};
pub use signal::WakeSignal;
pub use stack::WorkStack;
pub use work::Work;
pub use worker::thread_errors;
