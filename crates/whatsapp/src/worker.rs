//! Background consumer of the history sync queue.
//!
//! One item at a time: pop, resolve the owning account, decode, persist with
//! insert-if-absent. Any failure is logged and the item is dropped; the loop
//! only stops on shutdown.

use std::{sync::Arc, time::Duration};

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    wagate_common::Shutdown,
    wagate_queue::{HistorySyncItem, HistorySyncQueue, QueueError},
    wagate_store::{AccountStore, MessageStore},
};

use crate::{
    error::{Error, Result},
    history::{HistoryDecoder, JsonHistoryDecoder},
    jid::Jid,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one processed item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub decoded: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct HistorySyncWorker {
    queue: HistorySyncQueue,
    accounts: Arc<dyn AccountStore>,
    messages: Arc<dyn MessageStore>,
    decoder: Arc<dyn HistoryDecoder>,
    poll_interval: Duration,
}

impl HistorySyncWorker {
    pub fn new(
        queue: HistorySyncQueue,
        accounts: Arc<dyn AccountStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            queue,
            accounts,
            messages,
            decoder: Arc::new(JsonHistoryDecoder),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn HistoryDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Sleep between polls of an empty queue.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run on the shutdown tracker until shutdown is triggered.
    pub fn spawn(self, shutdown: &Shutdown) -> JoinHandle<()> {
        let cancel = shutdown.token();
        shutdown.spawn("history-sync-worker", async move { self.run(cancel).await })
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            queue = %self.queue.name(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "history sync worker started"
        );
        while !cancel.is_cancelled() {
            match self.queue.pop().await {
                Ok(Some(item)) => self.handle(item).await,
                Ok(None) => self.idle(&cancel).await,
                Err(e @ QueueError::Corrupt(_)) => {
                    warn!(error = %e, "dropping undecodable queue entry");
                    self.idle(&cancel).await;
                },
                Err(e) => {
                    error!(error = %e, "history sync queue unavailable");
                    self.idle(&cancel).await;
                },
            }
        }
        info!("history sync worker stopped");
    }

    async fn idle(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn handle(&self, item: HistorySyncItem) {
        match self.process(&item).await {
            Ok(stats) => info!(
                instance_id = %item.instance_id,
                decoded = stats.decoded,
                inserted = stats.inserted,
                duplicates = stats.duplicates,
                failed = stats.failed,
                "history sync applied"
            ),
            Err(e) => warn!(
                instance_id = %item.instance_id,
                bytes = item.payload.len(),
                error = %e,
                "history sync item dropped"
            ),
        }
    }

    /// Decode and persist one item.
    pub async fn process(&self, item: &HistorySyncItem) -> Result<SyncStats> {
        let owner = self
            .accounts
            .get(&item.instance_id)
            .await?
            .and_then(|a| a.owner_id)
            .ok_or_else(|| Error::UnknownInstance(item.instance_id.clone()))?;
        let owner = Jid::user(owner);

        let records = self
            .decoder
            .decode(&item.instance_id, &owner, &item.payload)?;

        let mut stats = SyncStats {
            decoded: records.len(),
            ..SyncStats::default()
        };
        for record in &records {
            match self.messages.insert_if_absent(record).await {
                Ok(true) => stats.inserted += 1,
                Ok(false) => stats.duplicates += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        instance_id = %item.instance_id,
                        message_id = %record.message_id,
                        error = %e,
                        "failed to store history message"
                    );
                },
            }
        }
        Ok(stats)
    }

    /// Process everything currently queued, then return. Used by tests and
    /// one-shot tooling.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.queue.pop().await {
                Ok(Some(item)) => {
                    self.handle(item).await;
                    handled += 1;
                },
                Ok(None) => break,
                Err(e @ QueueError::Corrupt(_)) => {
                    warn!(error = %e, "dropping undecodable queue entry");
                },
                Err(e) => {
                    error!(error = %e, "history sync queue unavailable");
                    break;
                },
            }
        }
        debug!(handled, "history sync queue drained");
        handled
    }
}

#[cfg(test)]
mod tests {
    use {
        async_trait::async_trait,
        wagate_queue::{MemoryBackend, QueueBackend},
    };

    use super::*;
    use crate::{
        history::{HistoryConversation, HistoryMessage, HistoryPayload},
        test_support::{Harness, wait_until},
    };

    fn history(chat: &str, ids: &[&str]) -> HistoryPayload {
        HistoryPayload {
            conversations: vec![HistoryConversation {
                id: format!("{chat}@s.whatsapp.net"),
                messages: ids
                    .iter()
                    .map(|id| HistoryMessage {
                        id: (*id).to_string(),
                        from_me: false,
                        participant: None,
                        timestamp: 1_700_000_000,
                        text: Some(format!("text {id}")),
                        media_type: None,
                    })
                    .collect(),
            }],
        }
    }

    fn payload(chat: &str, ids: &[&str]) -> Vec<u8> {
        history(chat, ids).to_bytes().unwrap()
    }

    fn worker(h: &Harness) -> HistorySyncWorker {
        HistorySyncWorker::new(h.queue.clone(), h.accounts.clone(), h.messages.clone())
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn applying_the_same_payload_twice_is_idempotent() {
        let h = Harness::new().await;
        h.accounts.upsert("t1", Some("15550001"), b"c").await.unwrap();
        let w = worker(&h);

        let item = HistorySyncItem::new("t1", payload("15559999", &["H1"]));
        let first = w.process(&item).await.unwrap();
        let second = w.process(&item).await.unwrap();

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);
        let rows = h.messages.list_chat("t1", "15559999").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner_id, "15550001");
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let h = Harness::new().await;
        let err = worker(&h)
            .process(&HistorySyncItem::new("ghost", payload("1555", &["X"])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownInstance(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn bad_items_do_not_stop_the_worker() {
        let h = Harness::new().await;
        h.accounts.upsert("t1", Some("15550001"), b"c").await.unwrap();

        h.queue
            .push(&HistorySyncItem::new("t1", payload("15559999", &["G1"])))
            .await
            .unwrap();
        h.queue
            .push(&HistorySyncItem::new("t1", b"{not json".to_vec()))
            .await
            .unwrap();
        h.queue
            .push(&HistorySyncItem::new("t1", payload("15559999", &["G2"])))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker(&h).run(cancel.clone()));

        wait_until(|| async { h.messages.count("t1").await.unwrap() == 2 }).await;
        assert!(h.queue.is_empty().await.unwrap());
        assert!(!handle.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn history_from_a_live_session_is_applied() {
        let h = Harness::new().await;
        h.paired("t1", "15550001").await;
        let _task = worker(&h).spawn(&h.shutdown);

        h.client("t1")
            .push_history(&history("15559999", &["L1", "L2"]))
            .await;
        wait_until(|| async { h.messages.count("t1").await.unwrap() == 2 }).await;

        h.shutdown.trigger();
        h.shutdown.wait().await;
    }

    /// Fails every call, as an unreachable queue store would.
    struct Unreachable;

    fn offline() -> QueueError {
        QueueError::Transport(sled::Error::Unsupported("offline".into()))
    }

    #[async_trait]
    impl QueueBackend for Unreachable {
        async fn push(&self, _item: Vec<u8>) -> wagate_queue::Result<()> {
            Err(offline())
        }

        async fn pop(&self) -> wagate_queue::Result<Option<Vec<u8>>> {
            Err(offline())
        }

        async fn len(&self) -> wagate_queue::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn transport_errors_back_off_until_shutdown() {
        let h = Harness::new().await;
        let queue = HistorySyncQueue::new("down", Arc::new(Unreachable));
        let w = HistorySyncWorker::new(queue, h.accounts.clone(), h.messages.clone())
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(w.drain().await, 0);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Takes a few milliseconds per pop, so the queue stays non-empty for
    /// the whole run.
    struct Slow(MemoryBackend);

    #[async_trait]
    impl QueueBackend for Slow {
        async fn push(&self, item: Vec<u8>) -> wagate_queue::Result<()> {
            self.0.push(item).await
        }

        async fn pop(&self) -> wagate_queue::Result<Option<Vec<u8>>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.0.pop().await
        }

        async fn len(&self) -> wagate_queue::Result<usize> {
            self.0.len().await
        }
    }

    #[tokio::test]
    async fn cancellation_is_seen_while_items_remain() {
        let h = Harness::new().await;
        h.accounts.upsert("t1", Some("15550001"), b"c").await.unwrap();
        let queue = HistorySyncQueue::new("busy", Arc::new(Slow(MemoryBackend::new())));
        for i in 0..200 {
            let id = format!("B{i}");
            queue
                .push(&HistorySyncItem::new("t1", payload("15559999", &[id.as_str()])))
                .await
                .unwrap();
        }
        let w = HistorySyncWorker::new(queue.clone(), h.accounts.clone(), h.messages.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(cancel.clone()));
        wait_until(|| async { h.messages.count("t1").await.unwrap() >= 2 }).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(queue.len().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_after_a_pause() {
        let h = Harness::new().await;
        h.accounts.upsert("t1", Some("15550001"), b"c").await.unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.push(vec![0xff, 0xff, 0xff]).await.unwrap();
        let queue = HistorySyncQueue::new("mixed", backend);
        queue
            .push(&HistorySyncItem::new("t1", payload("15559999", &["C1"])))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let w = HistorySyncWorker::new(queue.clone(), h.accounts.clone(), h.messages.clone())
            .with_poll_interval(Duration::from_millis(5));
        let handle = tokio::spawn(w.run(cancel.clone()));

        wait_until(|| async { h.messages.count("t1").await.unwrap() == 1 }).await;
        assert!(queue.is_empty().await.unwrap());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drain_empties_the_queue() {
        let h = Harness::new().await;
        h.accounts.upsert("t1", Some("15550001"), b"c").await.unwrap();
        let queue = HistorySyncQueue::new("drain", Arc::new(MemoryBackend::new()));
        for id in ["D1", "D2", "D3"] {
            queue
                .push(&HistorySyncItem::new("t1", payload("15559999", &[id])))
                .await
                .unwrap();
        }
        let w = HistorySyncWorker::new(queue.clone(), h.accounts.clone(), h.messages.clone());
        assert_eq!(w.drain().await, 3);
        assert!(queue.is_empty().await.unwrap());

        let ids: Vec<_> = h
            .messages
            .list_chat("t1", "15559999")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(ids.len(), 3);
    }
}
