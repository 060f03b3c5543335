//! Per-session event loop.
//!
//! Events are handled one at a time in arrival order. A failing handler is
//! logged and the loop moves on to the next event.

use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tracing::{debug, error, info, warn},
    wagate_queue::HistorySyncItem,
    wagate_store::MessageRecord,
};

use crate::{
    protocol::{IncomingMessage, ProtocolEvent},
    session::Session,
};

pub(crate) struct EventDispatcher {
    session: Arc<Session>,
}

impl EventDispatcher {
    pub(crate) fn spawn(session: Arc<Session>, mut rx: mpsc::Receiver<ProtocolEvent>) {
        let cancel = session.cancel_token();
        let shutdown = session.ctx.shutdown.clone();
        let dispatcher = Self { session };
        shutdown.spawn("event-dispatcher", async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => dispatcher.dispatch(event).await,
                        None => break,
                    },
                }
            }
            debug!(instance_id = %dispatcher.session.instance_id(), "event dispatcher stopped");
        });
    }

    async fn dispatch(&self, event: ProtocolEvent) {
        let session = &self.session;
        let instance_id = session.instance_id();
        match event {
            ProtocolEvent::Qr { code } => {
                if session.set_qr(code).await {
                    debug!(instance_id, "new pairing code");
                }
            },
            ProtocolEvent::PairSuccess {
                own_id,
                credentials,
            } => {
                if let Err(e) = session
                    .ctx
                    .accounts
                    .upsert(instance_id, Some(&own_id.user), &credentials)
                    .await
                {
                    error!(instance_id, error = %e, "failed to persist credentials after pairing");
                }
                if session.mark_connected(Some(own_id.clone())).await {
                    info!(instance_id, own_id = %own_id, "paired");
                }
            },
            ProtocolEvent::Connected => {
                if session.mark_connected(None).await {
                    info!(instance_id, "connected");
                }
            },
            ProtocolEvent::CredentialsUpdated { credentials } => {
                if let Err(e) = session
                    .ctx
                    .accounts
                    .upsert(instance_id, None, &credentials)
                    .await
                {
                    error!(instance_id, error = %e, "failed to persist updated credentials");
                }
            },
            ProtocolEvent::LoggedOut { reason } => {
                if let Err(e) = session.revoked(&reason).await {
                    error!(instance_id, error = %e, "failed to clean up revoked session");
                }
            },
            ProtocolEvent::Disconnected => {
                if session.mark_disconnected().await {
                    warn!(instance_id, "connection lost");
                    session.request_reconnect();
                }
            },
            ProtocolEvent::Message(msg) => self.persist_message(msg).await,
            ProtocolEvent::HistorySync { payload } => {
                let bytes = payload.len();
                let item = HistorySyncItem::new(instance_id, payload);
                match session.ctx.queue.push(&item).await {
                    Ok(()) => debug!(instance_id, bytes, "history sync queued"),
                    Err(e) => error!(instance_id, bytes, error = %e, "dropping history sync payload"),
                }
            },
        }
    }

    async fn persist_message(&self, msg: IncomingMessage) {
        let instance_id = self.session.instance_id();
        let Some(own_id) = self.session.own_id().await else {
            warn!(instance_id, message_id = %msg.id, "message before pairing, skipped");
            return;
        };
        let sender_id = if msg.from_me {
            own_id.user.clone()
        } else {
            msg.sender.user
        };
        let record = MessageRecord {
            instance_id: instance_id.to_string(),
            chat_id: msg.chat.user,
            message_id: msg.id,
            sender_id,
            owner_id: own_id.user,
            body: msg.text,
            media_type: msg.media,
            media_path: None,
            timestamp: msg.timestamp,
            from_me: msg.from_me,
        };
        match self.session.ctx.messages.insert_if_absent(&record).await {
            Ok(true) => debug!(instance_id, message_id = %record.message_id, "message stored"),
            Ok(false) => debug!(instance_id, message_id = %record.message_id, "duplicate message"),
            Err(e) => error!(instance_id, message_id = %record.message_id, error = %e, "failed to store message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use wagate_store::{AccountStore, MessageStore};

    use super::*;
    use crate::{
        jid::Jid,
        session::SessionStatus,
        test_support::{Harness, wait_for_status, wait_until},
    };

    fn incoming(id: &str, from_me: bool) -> IncomingMessage {
        IncomingMessage {
            id: id.into(),
            chat: Jid::user("15559999"),
            sender: Jid::user("15559999"),
            from_me,
            timestamp: 1_700_000_000,
            text: Some(format!("body {id}")),
            media: None,
        }
    }

    #[tokio::test]
    async fn pairing_persists_credentials() {
        let h = Harness::new().await;
        let session = h.registry.get_or_create("t1").await.unwrap();
        wait_for_status(&session, SessionStatus::QrPending).await;
        assert!(h.accounts.get("t1").await.unwrap().is_none());

        h.client("t1").pair("15550001").await;
        wait_for_status(&session, SessionStatus::Connected).await;
        wait_until(|| async { h.accounts.get("t1").await.unwrap().is_some() }).await;

        let account = h.accounts.get("t1").await.unwrap().unwrap();
        assert_eq!(account.owner_id.as_deref(), Some("15550001"));
        assert!(!account.credentials.is_empty());
        assert_eq!(session.own_id().await, Some(Jid::user("15550001")));
    }

    #[tokio::test]
    async fn live_messages_are_stored_once() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;
        let client = h.client("t1");

        client.deliver(incoming("A1", false)).await;
        client.deliver(incoming("A1", false)).await;
        client.deliver(incoming("A2", true)).await;
        wait_until(|| async { h.messages.count("t1").await.unwrap() == 2 }).await;

        let rows = h.messages.list_chat("t1", "15559999").await.unwrap();
        assert_eq!(rows.len(), 2);
        let mine = rows.iter().find(|r| r.message_id == "A2").unwrap();
        assert!(mine.from_me);
        assert_eq!(mine.sender_id, "15550001");
        assert_eq!(mine.owner_id, "15550001");
        let theirs = rows.iter().find(|r| r.message_id == "A1").unwrap();
        assert_eq!(theirs.sender_id, "15559999");
        assert_eq!(theirs.body.as_deref(), Some("body A1"));
    }

    #[tokio::test]
    async fn history_payloads_are_queued_unparsed() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;

        h.client("t1").push_raw_history(b"not even json".to_vec()).await;
        wait_until(|| async { h.queue.len().await.unwrap() == 1 }).await;

        let item = h.queue.pop().await.unwrap().unwrap();
        assert_eq!(item.instance_id, "t1");
        assert_eq!(item.payload, b"not even json");
        assert_eq!(h.messages.count("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credential_refresh_keeps_owner() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;

        h.client("t1").rotate_credentials(b"rotated".to_vec()).await;
        wait_until(|| async {
            h.accounts.get("t1").await.unwrap().map(|a| a.credentials) == Some(b"rotated".to_vec())
        })
        .await;
        let account = h.accounts.get("t1").await.unwrap().unwrap();
        assert_eq!(account.owner_id.as_deref(), Some("15550001"));
    }
}
