//! Logging facilities for the threading core.
//!
//! Crystal uses the `tracing` crate for instrumentation. To see logs, install
//! a tracing subscriber in your application:
//!
//! ```ignore
//! use tracing_subscriber;
//!
//! fn main() {
//!     // Initialize tracing (you can customize this)
//!     tracing_subscriber::fmt::init();
//!
//!     // Your application code...
//! }
//! ```

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "crystal_threading";
    /// Multi-worker dispatcher target.
    pub const DISPATCHER: &str = "crystal_threading::dispatcher";
    /// Dispatcher worker thread target.
    pub const WORKER: &str = "crystal_threading::worker";
    /// General-purpose thread pool target.
    pub const POOL: &str = "crystal_threading::pool";
    /// Periodic timer thread target.
    pub const TIMER: &str = "crystal_threading::timer";
}
