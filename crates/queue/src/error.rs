#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(#[from] sled::Error),

    #[error("failed to encode queue item: {0}")]
    Encode(#[source] postcard::Error),

    /// The stored envelope could not be decoded. It has already been removed.
    #[error("corrupt queue item: {0}")]
    Corrupt(#[source] postcard::Error),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
