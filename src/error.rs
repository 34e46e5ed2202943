//! Error types for the shard rebalancer.

use thiserror::Error;

/// Result type alias for rebalancer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the shard rebalancer.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction arguments.
    #[error("config error: {0}")]
    Config(String),

    /// A timed admission attempt could not be decided within its deadline.
    ///
    /// Distinct from the non-blocking `offer` returning `false`: this is
    /// raised only by the timed variants.
    #[error("admission timed out")]
    Timeout,

    /// The queue has been closed and accepts no further items.
    #[error("queue closed")]
    Closed,

    /// The operation was cancelled by a superseding request or shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// A physical relocation failed. Recorded per item; never aborts the
    /// engine.
    #[error("relocation failed: {0}")]
    Relocation(String),
}
