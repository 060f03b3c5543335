//! Boundary to the protocol layer.
//!
//! A protocol implementation owns the socket, the noise handshake, pairing
//! cryptography and the device store. Sessions only see the operations and
//! the event stream defined here.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::Serialize,
    tokio::sync::mpsc,
    wagate_common::MediaKind,
};

use crate::jid::Jid;

/// Everything the protocol layer reports for one connection.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A fresh pairing code. Any earlier code is no longer valid.
    Qr { code: String },
    /// Pairing completed; `credentials` is the device identity to persist.
    PairSuccess { own_id: Jid, credentials: Vec<u8> },
    /// Connected and authenticated with stored credentials.
    Connected,
    /// The device identity changed and must replace the stored one.
    CredentialsUpdated { credentials: Vec<u8> },
    /// The server revoked the session; credentials are no longer usable.
    LoggedOut { reason: String },
    /// The connection dropped.
    Disconnected,
    Message(IncomingMessage),
    /// A bulk history blob. Its format is interpreted by
    /// [`HistoryDecoder`](crate::history::HistoryDecoder) only.
    HistorySync { payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    pub from_me: bool,
    /// Unix seconds.
    pub timestamp: i64,
    pub text: Option<String>,
    pub media: Option<MediaKind>,
}

#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    Text(String),
    Media {
        kind: MediaKind,
        media: UploadedMedia,
        mime_type: String,
        caption: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Descriptor of an uploaded, encrypted media blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub url: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneCheck {
    pub query: String,
    pub jid: Option<String>,
    pub is_registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub jid: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub picture_url: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid credentials: {0}")]
    Credentials(String),
}

/// One connection to the protocol layer.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Establish the connection. Events for this connection are sent to
    /// `events` until it drops; a later `connect` reuses the same sender.
    async fn connect(&self, events: mpsc::Sender<ProtocolEvent>) -> Result<(), ProtocolError>;

    async fn disconnect(&self);

    async fn send_message(
        &self,
        to: &Jid,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, ProtocolError>;

    async fn upload(&self, data: &[u8], kind: MediaKind) -> Result<UploadedMedia, ProtocolError>;

    /// Ask the server to terminate this device's session.
    async fn logout(&self) -> Result<(), ProtocolError>;

    async fn check_phones(&self, phones: &[String]) -> Result<Vec<PhoneCheck>, ProtocolError>;

    async fn contact_info(&self, jid: &Jid) -> Result<ContactInfo, ProtocolError>;
}

/// Builds protocol clients.
pub trait Connector: Send + Sync {
    /// A client for `instance_id`, restored from `credentials` when the
    /// instance was paired before.
    fn client(
        &self,
        instance_id: &str,
        credentials: Option<&[u8]>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}
