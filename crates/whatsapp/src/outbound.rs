//! Sending on behalf of a tenant and recording what was sent.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    tracing::{info, warn},
    wagate_common::MediaKind,
    wagate_store::{MessageRecord, MessageStore},
};

use crate::{
    error::{Error, Result},
    jid::Jid,
    protocol::{OutgoingMessage, SendReceipt},
    registry::SessionRegistry,
    session::Session,
};

/// Where sent media bytes are kept for later retrieval.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Store `data` for `owner_id` under `message_id` and return its path.
    async fn save(
        &self,
        owner_id: &str,
        message_id: &str,
        mime_type: &str,
        data: &[u8],
    ) -> std::io::Result<PathBuf>;
}

pub struct Outbound {
    registry: Arc<SessionRegistry>,
    messages: Arc<dyn MessageStore>,
    media: Option<Arc<dyn MediaSink>>,
}

impl Outbound {
    pub fn new(registry: Arc<SessionRegistry>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            registry,
            messages,
            media: None,
        }
    }

    pub fn with_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.media = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn send_text(&self, instance_id: &str, to: &Jid, text: &str) -> Result<MessageRecord> {
        if text.is_empty() {
            return Err(Error::Validation("text must not be empty".into()));
        }
        let session = self.registry.get_authenticated(instance_id).await?;
        let receipt = session
            .send_message(to, OutgoingMessage::Text(text.to_string()))
            .await?;
        let mut record = record_for(&session, to, &receipt).await?;
        record.body = Some(text.to_string());
        self.persist(record).await
    }

    pub async fn send_media(
        &self,
        instance_id: &str,
        to: &Jid,
        data: &[u8],
        kind: MediaKind,
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<MessageRecord> {
        if data.is_empty() {
            return Err(Error::Validation("media must not be empty".into()));
        }
        let session = self.registry.get_authenticated(instance_id).await?;
        let uploaded = session.upload_media(data, kind).await?;
        let receipt = session
            .send_message(to, OutgoingMessage::Media {
                kind,
                media: uploaded,
                mime_type: mime_type.to_string(),
                caption: caption.map(str::to_string),
            })
            .await?;

        let mut record = record_for(&session, to, &receipt).await?;
        record.body = caption.map(str::to_string);
        record.media_type = Some(kind);
        if let Some(sink) = &self.media {
            let path = sink
                .save(&record.owner_id, &record.message_id, mime_type, data)
                .await
                .map_err(Error::Media)?;
            record.media_path = Some(path.to_string_lossy().into_owned());
        }
        self.persist(record).await
    }

    pub async fn send_image(
        &self,
        instance_id: &str,
        to: &Jid,
        data: &[u8],
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<MessageRecord> {
        self.send_media(instance_id, to, data, MediaKind::Image, mime_type, caption)
            .await
    }

    pub async fn send_audio(
        &self,
        instance_id: &str,
        to: &Jid,
        data: &[u8],
        mime_type: &str,
    ) -> Result<MessageRecord> {
        self.send_media(instance_id, to, data, MediaKind::Audio, mime_type, None)
            .await
    }

    async fn persist(&self, record: MessageRecord) -> Result<MessageRecord> {
        if !self.messages.insert_if_absent(&record).await? {
            warn!(
                instance_id = %record.instance_id,
                message_id = %record.message_id,
                "sent message already recorded"
            );
        }
        info!(
            instance_id = %record.instance_id,
            chat_id = %record.chat_id,
            message_id = %record.message_id,
            media = record.media_type.map(|m| m.as_str()),
            "message sent"
        );
        Ok(record)
    }
}

async fn record_for(session: &Session, to: &Jid, receipt: &SendReceipt) -> Result<MessageRecord> {
    let own = session
        .own_id()
        .await
        .ok_or_else(|| Error::NotAuthenticated(session.instance_id().to_string()))?;
    Ok(MessageRecord {
        instance_id: session.instance_id().to_string(),
        chat_id: to.user.clone(),
        message_id: receipt.message_id.clone(),
        sender_id: own.user.clone(),
        owner_id: own.user,
        body: None,
        media_type: None,
        media_path: None,
        timestamp: receipt.timestamp,
        from_me: true,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::Harness;

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        async fn save(
            &self,
            owner_id: &str,
            message_id: &str,
            _mime_type: &str,
            data: &[u8],
        ) -> std::io::Result<PathBuf> {
            self.saved.lock().unwrap().push((
                owner_id.to_string(),
                message_id.to_string(),
                data.len(),
            ));
            Ok(PathBuf::from(format!("/media/{owner_id}/{message_id}.png")))
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl MediaSink for BrokenSink {
        async fn save(&self, _: &str, _: &str, _: &str, _: &[u8]) -> std::io::Result<PathBuf> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[tokio::test]
    async fn send_text_records_the_message() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;
        let outbound = Outbound::new(h.registry.clone(), h.messages.clone());

        let to = Jid::from_phone("+1 555 999 9").unwrap();
        let record = outbound.send_text("t1", &to, "hello").await.unwrap();

        assert!(record.from_me);
        assert_eq!(record.chat_id, "15559999");
        assert_eq!(record.sender_id, "15550001");
        assert_eq!(record.owner_id, "15550001");
        assert_eq!(record.body.as_deref(), Some("hello"));

        let rows = h.messages.list_chat("t1", "15559999").await.unwrap();
        assert_eq!(rows, vec![record.clone()]);
        let sent = h.client("t1").sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, to);
    }

    #[tokio::test]
    async fn send_requires_an_authenticated_session() {
        let h = Harness::new().await;
        let outbound = Outbound::new(h.registry.clone(), h.messages.clone());
        let err = outbound
            .send_text("t1", &Jid::user("15559999"), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(_)));
        assert_eq!(h.messages.count("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_send_records_nothing() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;
        h.client("t1").fail_sends(true);
        let outbound = Outbound::new(h.registry.clone(), h.messages.clone());

        let err = outbound
            .send_text("t1", &Jid::user("15559999"), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
        assert_eq!(h.messages.count("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_media_saves_bytes_and_path() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;
        let sink = Arc::new(RecordingSink::default());
        let outbound = Outbound::new(h.registry.clone(), h.messages.clone())
            .with_media_sink(sink.clone());

        let record = outbound
            .send_media(
                "t1",
                &Jid::user("15559999"),
                b"\x89PNG....",
                MediaKind::Image,
                "image/png",
                Some("look"),
            )
            .await
            .unwrap();

        assert_eq!(record.media_type, Some(MediaKind::Image));
        assert_eq!(record.body.as_deref(), Some("look"));
        assert_eq!(
            record.media_path.as_deref(),
            Some(format!("/media/15550001/{}.png", record.message_id).as_str())
        );
        let saved = sink.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![(
            "15550001".to_string(),
            record.message_id.clone(),
            8
        )]);
    }

    #[tokio::test]
    async fn media_write_failure_is_reported() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;
        let outbound = Outbound::new(h.registry.clone(), h.messages.clone())
            .with_media_sink(Arc::new(BrokenSink));

        let err = outbound
            .send_media("t1", &Jid::user("15559999"), b"abc", MediaKind::Audio, "audio/ogg", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Media(_)));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let h = Harness::new().await;
        let outbound = Outbound::new(h.registry.clone(), h.messages.clone());
        let to = Jid::user("15559999");
        assert!(matches!(
            outbound.send_text("t1", &to, "").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            outbound
                .send_media("t1", &to, b"", MediaKind::Image, "image/png", None)
                .await,
            Err(Error::Validation(_))
        ));
        assert_eq!(h.connector.builds("t1"), 0);
    }
}
