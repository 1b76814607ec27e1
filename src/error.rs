use thiserror::Error;

/// Errors that stop the relay server itself. Per-connection failures never
/// surface here; they end only the connection they belong to.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Underlying I/O error, e.g. binding the listen address.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The accept loop task panicked or was cancelled.
    #[error("relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// A configuration value is out of range.
    #[error("configuration error: {0}")]
    Config(String),
}
