use std::io;

use thiserror::Error;

/// Errors raised while constructing bridge queues.
///
/// Construction failures are always synchronous; once a queue exists, task
/// failures are delivered through its error handler instead (see
/// [`crate::TaskError`]).
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The platform could not provide a thread for a queue or dispatcher
    /// loop.
    #[error("failed to spawn queue thread: {0}")]
    ThreadSpawn(#[from] io::Error),
}
