//! Error types for the threading core.

/// Result type alias for threading operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or growing threading primitives.
///
/// Contract misuse (pushing or draining after termination) is a debug
/// assertion rather than an error value; see the individual methods on
/// [`Dispatcher`](crate::Dispatcher) and [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Spawning a native worker thread failed.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The pool has already been terminated.
    #[error("thread pool has already been terminated")]
    Terminated,
}

impl Error {
    /// Create a spawn error for the named thread.
    pub fn spawn(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }
}
