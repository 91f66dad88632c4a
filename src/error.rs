//! Error types for spindle-rs.

use thiserror::Error;

/// Errors that can occur when building or driving a spindle pool.
#[derive(Debug, Error)]
pub enum SpindleError {
    /// Error parsing a CPU set string.
    #[error("invalid cpuset format: {0}")]
    InvalidCpuSet(String),

    /// CPU ID is not available on this system.
    #[error("CPU {0} is not available on this system")]
    CpuNotAvailable(usize),

    /// No CPUs available after applying constraints.
    #[error("no CPUs available after applying constraints")]
    NoCpusAvailable,

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Error spawning an OS thread for a context or fiber.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// Error setting thread affinity.
    #[error("failed to set thread affinity for CPU {0}")]
    AffinityFailed(usize),

    /// Thread count mismatch - not enough CPUs for the requested contexts.
    #[error("requested {requested} context threads but only {available} CPUs available")]
    InsufficientCpus { requested: usize, available: usize },

    /// Operation requires a running pool.
    #[error("the context pool is not running")]
    PoolNotRunning,
}

/// Result type alias for spindle operations.
pub type Result<T> = std::result::Result<T, SpindleError>;
