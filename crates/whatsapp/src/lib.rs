//! WhatsApp instance management.
//!
//! A [`SessionRegistry`] owns one [`Session`] per tenant instance. Each session
//! wraps a [`ProtocolClient`] supplied by a [`Connector`] and runs its own
//! event dispatcher task, which persists live messages and hands history
//! sync payloads to the shared queue. The [`HistorySyncWorker`] drains that
//! queue in the background.
//!
//! The wire protocol, pairing and encryption live behind the protocol traits.
//! With the `web` feature, `web` implements them over `whatsapp-rust`;
//! [`sim`] is an in-process implementation.

mod dispatcher;
pub mod error;
pub mod history;
pub mod jid;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sim;
#[cfg(feature = "web")]
pub mod web;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use {
    error::{Error, Result},
    history::{DecodeError, HistoryDecoder, HistoryPayload, JsonHistoryDecoder},
    jid::{InvalidJid, Jid},
    outbound::{MediaSink, Outbound},
    protocol::{
        ContactInfo, Connector, IncomingMessage, OutgoingMessage, PhoneCheck, ProtocolClient,
        ProtocolError, ProtocolEvent, SendReceipt, UploadedMedia,
    },
    registry::{SessionDeps, SessionRegistry},
    session::{Backoff, Session, SessionStatus},
    worker::{HistorySyncWorker, SyncStats},
};
