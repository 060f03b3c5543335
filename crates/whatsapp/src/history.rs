//! History sync payload decoding.
//!
//! The queue and the dispatcher treat payloads as opaque bytes; only the
//! worker interprets them, through a [`HistoryDecoder`].
//!
//! The shipped decoder reads the JSON form:
//!
//! ```json
//! {"conversations": [
//!   {"id": "15559999@s.whatsapp.net",
//!    "messages": [{"id": "3EB0..", "fromMe": false, "timestamp": 1700000000,
//!                  "text": "hi", "participant": "..."}]}
//! ]}
//! ```

use {
    serde::{Deserialize, Serialize},
    tracing::warn,
    wagate_common::MediaKind,
    wagate_store::MessageRecord,
};

use crate::jid::Jid;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed history payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub trait HistoryDecoder: Send + Sync {
    /// Turn one payload into message records owned by `owner`.
    fn decode(
        &self,
        instance_id: &str,
        owner: &Jid,
        payload: &[u8],
    ) -> Result<Vec<MessageRecord>, DecodeError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    #[serde(default)]
    pub conversations: Vec<HistoryConversation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConversation {
    /// Chat address.
    pub id: String,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    /// Sender in group chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
}

impl HistoryPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHistoryDecoder;

impl HistoryDecoder for JsonHistoryDecoder {
    fn decode(
        &self,
        instance_id: &str,
        owner: &Jid,
        payload: &[u8],
    ) -> Result<Vec<MessageRecord>, DecodeError> {
        let payload: HistoryPayload = serde_json::from_slice(payload)?;
        let mut records = Vec::new();
        for conv in payload.conversations {
            let chat: Jid = match conv.id.parse() {
                Ok(chat) => chat,
                Err(e) => {
                    warn!(instance_id, error = %e, "skipping conversation with bad id");
                    continue;
                },
            };
            for msg in conv.messages {
                if msg.id.is_empty() {
                    continue;
                }
                let sender_id = if msg.from_me {
                    owner.user.clone()
                } else {
                    msg.participant
                        .as_deref()
                        .and_then(|p| p.parse::<Jid>().ok())
                        .map_or_else(|| chat.user.clone(), |p| p.user)
                };
                records.push(MessageRecord {
                    instance_id: instance_id.to_string(),
                    chat_id: chat.user.clone(),
                    message_id: msg.id,
                    sender_id,
                    owner_id: owner.user.clone(),
                    body: msg.text,
                    media_type: msg.media_type,
                    media_path: None,
                    timestamp: msg.timestamp,
                    from_me: msg.from_me,
                });
            }
        }
        Ok(records)
    }
}
