use {wagate_queue::QueueError, wagate_store::StoreError};

use crate::{history::DecodeError, protocol::ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("instance {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("instance {0} is not connected")]
    NotConnected(String),

    #[error("instance {0} is not waiting for a QR scan")]
    NotInQrState(String),

    #[error("failed to create session for {instance_id}: {reason}")]
    SessionCreationFailed { instance_id: String, reason: String },

    #[error("no account stored for instance {0}")]
    UnknownInstance(String),

    #[error("send failed: {0}")]
    SendFailed(#[source] ProtocolError),

    #[error("upload failed: {0}")]
    UploadFailed(#[source] ProtocolError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] QueueError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("failed to store media: {0}")]
    Media(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
