//! Protocol layer backed by `whatsapp-rust`.
//!
//! Each instance keeps its device keys in a sled database under
//! `<devices_dir>/<instance_id>`. The stored credentials blob only records
//! where that database lives, so pairing state never passes through the
//! account store twice.

mod store;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::{
        sync::{Mutex, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
    wacore::{
        download::MediaType,
        types::{events::Event, message::MessageInfo},
    },
    wacore_binary::jid::Jid as WireJid,
    waproto::whatsapp as wa,
    wagate_common::{MediaKind, time::now_secs},
    whatsapp_rust::{Client, bot::Bot},
    whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory,
    whatsapp_rust_ureq_http_client::UreqHttpClient,
};

use {
    self::store::SledDeviceStore,
    crate::{
        history::{HistoryConversation, HistoryMessage, HistoryPayload},
        jid::Jid,
        protocol::{
            ContactInfo, Connector, IncomingMessage, OutgoingMessage, PhoneCheck, ProtocolClient,
            ProtocolError, ProtocolEvent, SendReceipt, UploadedMedia,
        },
    },
};

#[derive(Debug, Serialize, Deserialize)]
struct WebCredentials {
    device_dir: PathBuf,
}

impl WebCredentials {
    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Builds [`WebClient`]s rooted at one devices directory.
pub struct WebConnector {
    devices_dir: PathBuf,
}

impl WebConnector {
    pub fn new(devices_dir: &Path) -> Self {
        Self {
            devices_dir: devices_dir.to_path_buf(),
        }
    }
}

impl Connector for WebConnector {
    fn client(
        &self,
        instance_id: &str,
        credentials: Option<&[u8]>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        let (device_dir, paired) = match credentials {
            Some(raw) => {
                let creds: WebCredentials = serde_json::from_slice(raw)
                    .map_err(|e| ProtocolError::Credentials(e.to_string()))?;
                (creds.device_dir, true)
            },
            None => (self.devices_dir.join(instance_id), false),
        };
        Ok(Arc::new(WebClient {
            instance_id: instance_id.to_string(),
            device_dir,
            paired,
            inner: Mutex::new(Running::default()),
        }))
    }
}

#[derive(Default)]
struct Running {
    store: Option<Arc<SledDeviceStore>>,
    bot: Option<Bot>,
    client: Option<Arc<Client>>,
    task: Option<JoinHandle<()>>,
}

impl Running {
    async fn stop(&mut self) {
        if let Some(client) = self.client.take() {
            client.disconnect().await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.bot = None;
    }
}

pub struct WebClient {
    instance_id: String,
    device_dir: PathBuf,
    paired: bool,
    inner: Mutex<Running>,
}

impl WebClient {
    async fn open_store(&self, running: &mut Running) -> Result<Arc<SledDeviceStore>, ProtocolError> {
        if let Some(store) = &running.store {
            return Ok(Arc::clone(store));
        }
        if !self.paired && self.device_dir.exists() {
            debug!(instance_id = %self.instance_id, "clearing stale device state");
            tokio::fs::remove_dir_all(&self.device_dir)
                .await
                .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        }
        let store = Arc::new(
            SledDeviceStore::open(&self.device_dir)
                .map_err(|e| ProtocolError::Connect(e.to_string()))?,
        );
        running.store = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn client(&self) -> Result<Arc<Client>, ProtocolError> {
        self.inner
            .lock()
            .await
            .client
            .clone()
            .ok_or(ProtocolError::NotConnected)
    }
}

#[async_trait]
impl ProtocolClient for WebClient {
    async fn connect(&self, events: mpsc::Sender<ProtocolEvent>) -> Result<(), ProtocolError> {
        let mut running = self.inner.lock().await;
        running.stop().await;
        let store = self.open_store(&mut running).await?;

        let instance_id = self.instance_id.clone();
        let credentials = WebCredentials {
            device_dir: self.device_dir.clone(),
        }
        .encode();
        let mut bot = Bot::builder()
            .with_backend(store)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let events = events.clone();
                let instance_id = instance_id.clone();
                let credentials = credentials.clone();
                async move {
                    let Some(event) = translate(event, &credentials) else {
                        return;
                    };
                    if events.send(event).await.is_err() {
                        debug!(%instance_id, "event receiver gone");
                    }
                }
            })
            .build()
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;

        running.client = Some(bot.client());
        let task = bot
            .run()
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        running.task = Some(task);
        running.bot = Some(bot);
        info!(instance_id = %self.instance_id, "web client started");
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.lock().await.stop().await;
    }

    async fn send_message(
        &self,
        to: &Jid,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, ProtocolError> {
        let client = self.client().await?;
        let message_id = client
            .send_message(wire_jid(to)?, outgoing(message))
            .await
            .map_err(|e| ProtocolError::Request(e.to_string()))?;
        Ok(SendReceipt {
            message_id,
            timestamp: now_secs(),
        })
    }

    async fn upload(&self, data: &[u8], kind: MediaKind) -> Result<UploadedMedia, ProtocolError> {
        let client = self.client().await?;
        let media_type = match kind {
            MediaKind::Image => MediaType::Image,
            MediaKind::Audio => MediaType::Audio,
            MediaKind::Video => MediaType::Video,
            MediaKind::Document => MediaType::Document,
            MediaKind::Sticker => MediaType::Sticker,
        };
        let uploaded = client
            .upload(data.to_vec(), media_type)
            .await
            .map_err(|e| ProtocolError::Request(e.to_string()))?;
        Ok(UploadedMedia {
            url: uploaded.url,
            direct_path: uploaded.direct_path,
            media_key: uploaded.media_key.to_vec(),
            file_sha256: uploaded.file_sha256.to_vec(),
            file_enc_sha256: uploaded.file_enc_sha256.to_vec(),
            file_length: uploaded.file_length,
        })
    }

    /// Drops the connection and the local device keys. The phone still lists
    /// the linked device until it is removed there.
    async fn logout(&self) -> Result<(), ProtocolError> {
        let mut running = self.inner.lock().await;
        running.stop().await;
        running.store = None;
        if self.device_dir.exists() {
            tokio::fs::remove_dir_all(&self.device_dir)
                .await
                .map_err(|e| ProtocolError::Request(e.to_string()))?;
        }
        Ok(())
    }

    async fn check_phones(&self, _phones: &[String]) -> Result<Vec<PhoneCheck>, ProtocolError> {
        Err(ProtocolError::Request(
            "phone lookup is not available on the web backend".into(),
        ))
    }

    async fn contact_info(&self, _jid: &Jid) -> Result<ContactInfo, ProtocolError> {
        Err(ProtocolError::Request(
            "contact lookup is not available on the web backend".into(),
        ))
    }
}

fn wire_jid(jid: &Jid) -> Result<WireJid, ProtocolError> {
    jid.to_string()
        .parse()
        .map_err(|_| ProtocolError::Request(format!("unsupported address {jid}")))
}

fn local_jid(jid: &WireJid) -> Option<Jid> {
    jid.to_string().parse().ok()
}

fn translate(event: Event, credentials: &[u8]) -> Option<ProtocolEvent> {
    match event {
        Event::PairingQrCode { code, .. } => Some(ProtocolEvent::Qr { code }),
        Event::PairSuccess(pair) => match local_jid(&pair.id) {
            Some(own_id) => Some(ProtocolEvent::PairSuccess {
                own_id,
                credentials: credentials.to_vec(),
            }),
            None => {
                warn!(id = %pair.id, "paired with an unreadable address");
                None
            },
        },
        Event::Connected(_) => Some(ProtocolEvent::Connected),
        Event::Disconnected(_) => Some(ProtocolEvent::Disconnected),
        Event::LoggedOut(out) => Some(ProtocolEvent::LoggedOut {
            reason: format!("{:?}", out.reason),
        }),
        Event::Message(msg, info) => incoming(&msg, &info).map(ProtocolEvent::Message),
        Event::HistorySync(history) => match history_payload(&history).to_bytes() {
            Ok(payload) => Some(ProtocolEvent::HistorySync { payload }),
            Err(e) => {
                warn!(error = %e, "dropping unencodable history sync");
                None
            },
        },
        _ => None,
    }
}

fn text_of(msg: &wa::Message) -> Option<String> {
    msg.conversation
        .clone()
        .or_else(|| {
            msg.extended_text_message
                .as_ref()
                .and_then(|m| m.text.clone())
        })
        .or_else(|| msg.image_message.as_ref().and_then(|m| m.caption.clone()))
        .or_else(|| msg.video_message.as_ref().and_then(|m| m.caption.clone()))
}

fn media_of(msg: &wa::Message) -> Option<MediaKind> {
    if msg.image_message.is_some() {
        Some(MediaKind::Image)
    } else if msg.audio_message.is_some() {
        Some(MediaKind::Audio)
    } else if msg.video_message.is_some() {
        Some(MediaKind::Video)
    } else if msg.document_message.is_some() {
        Some(MediaKind::Document)
    } else if msg.sticker_message.is_some() {
        Some(MediaKind::Sticker)
    } else {
        None
    }
}

fn incoming(msg: &wa::Message, info: &MessageInfo) -> Option<IncomingMessage> {
    Some(IncomingMessage {
        id: info.id.clone(),
        chat: local_jid(&info.source.chat)?,
        sender: local_jid(&info.source.sender)?,
        from_me: info.source.is_from_me,
        timestamp: info.timestamp.timestamp(),
        text: text_of(msg),
        media: media_of(msg),
    })
}

fn history_payload(history: &wa::HistorySync) -> HistoryPayload {
    HistoryPayload {
        conversations: history
            .conversations
            .iter()
            .map(|conv| HistoryConversation {
                id: conv.id.clone(),
                messages: conv
                    .messages
                    .iter()
                    .filter_map(|m| m.message.as_ref())
                    .filter_map(|web| {
                        let key = web.key.as_ref()?;
                        Some(HistoryMessage {
                            id: key.id().to_string(),
                            from_me: key.from_me(),
                            participant: key.participant.clone().or_else(|| web.participant.clone()),
                            timestamp: i64::try_from(web.message_timestamp()).unwrap_or_default(),
                            text: web.message.as_ref().and_then(text_of),
                            media_type: web.message.as_ref().and_then(media_of),
                        })
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn outgoing(message: OutgoingMessage) -> wa::Message {
    let (kind, media, mime_type, caption) = match message {
        OutgoingMessage::Text(text) => {
            return wa::Message {
                conversation: Some(text),
                ..Default::default()
            };
        },
        OutgoingMessage::Media {
            kind,
            media,
            mime_type,
            caption,
        } => (kind, media, mime_type, caption),
    };
    let length = Some(media.file_length);
    match kind {
        MediaKind::Image | MediaKind::Sticker => wa::Message {
            image_message: Some(Box::new(wa::message::ImageMessage {
                url: Some(media.url),
                direct_path: Some(media.direct_path),
                media_key: Some(media.media_key),
                file_sha256: Some(media.file_sha256),
                file_enc_sha256: Some(media.file_enc_sha256),
                file_length: length,
                mimetype: Some(mime_type),
                caption,
                ..Default::default()
            })),
            ..Default::default()
        },
        MediaKind::Audio => wa::Message {
            audio_message: Some(Box::new(wa::message::AudioMessage {
                url: Some(media.url),
                direct_path: Some(media.direct_path),
                media_key: Some(media.media_key),
                file_sha256: Some(media.file_sha256),
                file_enc_sha256: Some(media.file_enc_sha256),
                file_length: length,
                mimetype: Some(mime_type),
                ptt: Some(true),
                ..Default::default()
            })),
            ..Default::default()
        },
        MediaKind::Video => wa::Message {
            video_message: Some(Box::new(wa::message::VideoMessage {
                url: Some(media.url),
                direct_path: Some(media.direct_path),
                media_key: Some(media.media_key),
                file_sha256: Some(media.file_sha256),
                file_enc_sha256: Some(media.file_enc_sha256),
                file_length: length,
                mimetype: Some(mime_type),
                caption,
                ..Default::default()
            })),
            ..Default::default()
        },
        MediaKind::Document => wa::Message {
            document_message: Some(Box::new(wa::message::DocumentMessage {
                url: Some(media.url),
                direct_path: Some(media.direct_path),
                media_key: Some(media.media_key),
                file_sha256: Some(media.file_sha256),
                file_enc_sha256: Some(media.file_enc_sha256),
                file_length: length,
                mimetype: Some(mime_type),
                caption,
                ..Default::default()
            })),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploaded() -> UploadedMedia {
        UploadedMedia {
            url: "https://mmg.example/x".into(),
            direct_path: "/v/x".into(),
            media_key: vec![1; 32],
            file_sha256: vec![2; 32],
            file_enc_sha256: vec![3; 32],
            file_length: 42,
        }
    }

    #[test]
    fn text_goes_out_as_conversation() {
        let msg = outgoing(OutgoingMessage::Text("hi".into()));
        assert_eq!(msg.conversation.as_deref(), Some("hi"));
        assert!(msg.image_message.is_none());
    }

    #[test]
    fn audio_goes_out_as_voice_note() {
        let msg = outgoing(OutgoingMessage::Media {
            kind: MediaKind::Audio,
            media: uploaded(),
            mime_type: "audio/ogg; codecs=opus".into(),
            caption: None,
        });
        let audio = msg.audio_message.unwrap();
        assert_eq!(audio.ptt, Some(true));
        assert_eq!(audio.file_length, Some(42));
        assert_eq!(audio.media_key.as_deref(), Some(&[1u8; 32][..]));
    }

    #[test]
    fn image_caption_is_read_back_as_text() {
        let msg = outgoing(OutgoingMessage::Media {
            kind: MediaKind::Image,
            media: uploaded(),
            mime_type: "image/png".into(),
            caption: Some("look".into()),
        });
        assert_eq!(text_of(&msg).as_deref(), Some("look"));
        assert_eq!(media_of(&msg), Some(MediaKind::Image));
    }

    #[test]
    fn history_sync_becomes_json_payload() {
        let history = wa::HistorySync {
            conversations: vec![wa::Conversation {
                id: "15559999@s.whatsapp.net".into(),
                messages: vec![
                    wa::HistorySyncMsg {
                        message: Some(wa::WebMessageInfo {
                            key: Some(wa::MessageKey {
                                id: Some("H1".into()),
                                from_me: Some(true),
                                ..Default::default()
                            }),
                            message: Some(wa::Message {
                                conversation: Some("old".into()),
                                ..Default::default()
                            }),
                            message_timestamp: Some(1_700_000_000),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    wa::HistorySyncMsg::default(),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let payload = history_payload(&history);
        assert_eq!(payload.conversations.len(), 1);
        let msgs = &payload.conversations[0].messages;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, "H1");
        assert!(msgs[0].from_me);
        assert_eq!(msgs[0].timestamp, 1_700_000_000);
        assert_eq!(msgs[0].text.as_deref(), Some("old"));
    }

    #[test]
    fn stored_credentials_point_at_the_device_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = WebConnector::new(tmp.path());
        let creds = WebCredentials {
            device_dir: tmp.path().join("elsewhere"),
        }
        .encode();
        assert!(connector.client("t1", Some(&creds)).is_ok());
        assert!(matches!(
            connector.client("t1", Some(b"not json")),
            Err(ProtocolError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn logout_removes_device_state() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = WebConnector::new(tmp.path());
        let client = connector.client("t1", None).unwrap();
        std::fs::create_dir_all(tmp.path().join("t1")).unwrap();

        client.logout().await.unwrap();
        assert!(!tmp.path().join("t1").exists());
        assert!(matches!(
            client.send_message(&Jid::user("1555"), OutgoingMessage::Text("x".into())).await,
            Err(ProtocolError::NotConnected)
        ));
    }
}
