use crate::types::Priority;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid max batch size for priority {0} (must be at least 1)")]
    InvalidBatchSize(Priority),

    #[error("Invalid max queue size ({0}), backpressure requires a nonzero ceiling")]
    InvalidQueueCapacity(usize),

    #[error("Invalid retry attempt limit (0), retries require at least one attempt")]
    InvalidRetryAttempts,

    #[error("A tokio runtime is required to construct the dispatcher")]
    RuntimeUnavailable,

    #[error(
        "Encountered an IO error while accessing the event journal ({})",
        .0.kind()
    )]
    Io(#[from] io::Error),
}
