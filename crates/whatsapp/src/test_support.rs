//! Shared fixtures for the crate's tests.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    wagate_common::Shutdown,
    wagate_queue::HistorySyncQueue,
    wagate_store::{Account, AccountStore, SqliteAccountStore, SqliteMessageStore},
};

use crate::{
    registry::{SessionDeps, SessionRegistry},
    session::{Backoff, Session, SessionStatus},
    sim::{SimClient, SimConnector},
};

/// Account store that counts deletions.
pub struct CountingAccounts {
    inner: SqliteAccountStore,
    deletes: AtomicUsize,
}

impl CountingAccounts {
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for CountingAccounts {
    async fn get(&self, instance_id: &str) -> wagate_store::Result<Option<Account>> {
        self.inner.get(instance_id).await
    }

    async fn list(&self) -> wagate_store::Result<Vec<Account>> {
        self.inner.list().await
    }

    async fn upsert(
        &self,
        instance_id: &str,
        owner_id: Option<&str>,
        credentials: &[u8],
    ) -> wagate_store::Result<()> {
        self.inner.upsert(instance_id, owner_id, credentials).await
    }

    async fn delete(&self, instance_id: &str) -> wagate_store::Result<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(instance_id).await
    }
}

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<SimConnector>,
    pub accounts: Arc<CountingAccounts>,
    pub messages: Arc<SqliteMessageStore>,
    pub queue: HistorySyncQueue,
    pub shutdown: Shutdown,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = wagate_store::open_in_memory().await.unwrap();
        let accounts = Arc::new(CountingAccounts {
            inner: SqliteAccountStore::new(pool.clone()),
            deletes: AtomicUsize::new(0),
        });
        let messages = Arc::new(SqliteMessageStore::new(pool));
        let queue = HistorySyncQueue::in_memory("history_sync");
        let connector = Arc::new(SimConnector::new());
        let shutdown = Shutdown::new();
        let registry = SessionRegistry::new(connector.clone(), SessionDeps {
            accounts: accounts.clone(),
            messages: messages.clone(),
            queue: queue.clone(),
            backoff: Backoff {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(200),
                multiplier: 2.0,
            },
            shutdown: shutdown.clone(),
        });
        Self {
            registry,
            connector,
            accounts,
            messages,
            queue,
            shutdown,
        }
    }

    /// The sim client behind `instance_id`'s current session.
    pub fn client(&self, instance_id: &str) -> Arc<SimClient> {
        self.connector.client_for(instance_id).unwrap()
    }

    /// A session paired as `phone`, connected, with its credentials stored.
    pub async fn paired(&self, instance_id: &str, phone: &str) -> Arc<Session> {
        let session = self.registry.get_or_create(instance_id).await.unwrap();
        wait_for_status(&session, SessionStatus::QrPending).await;
        self.client(instance_id).pair(phone).await;
        wait_for_status(&session, SessionStatus::Connected).await;
        wait_until(|| async { self.accounts.get(instance_id).await.unwrap().is_some() }).await;
        session
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub async fn wait_for_status(session: &Session, status: SessionStatus) {
    wait_until(|| async { session.status().await == status }).await;
}
