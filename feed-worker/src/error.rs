use feed_common::queue::QueueError;
use feed_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors related to initialization and consumption of
/// subscription events.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a feed store error occurred while processing an event")]
    StoreError(#[from] StoreError),
    #[error("an event queue error occurred")]
    QueueError(#[from] QueueError),
}
