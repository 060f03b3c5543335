//! Instance id → live session.
//!
//! The registry lock guards only the map. Each id gets its own
//! [`OnceCell`], so building a session (which reads the account store and
//! connects) never blocks lookups of other ids, while two callers racing on
//! the same id still end up with one session.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use {
    tokio::sync::{Mutex, OnceCell},
    tracing::{debug, info, warn},
    wagate_common::Shutdown,
    wagate_queue::HistorySyncQueue,
    wagate_store::{AccountStore, MessageStore},
};

use crate::{
    error::{Error, Result},
    jid::Jid,
    protocol::Connector,
    session::{Backoff, Session, SessionStatus},
};

/// Shared collaborators handed to every session.
pub struct SessionDeps {
    pub accounts: Arc<dyn AccountStore>,
    pub messages: Arc<dyn MessageStore>,
    pub queue: HistorySyncQueue,
    pub backoff: Backoff,
    pub shutdown: Shutdown,
}

type Slot = Arc<OnceCell<Arc<Session>>>;

pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    connector: Arc<dyn Connector>,
    ctx: Arc<SessionDeps>,
    self_ref: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, deps: SessionDeps) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            slots: Mutex::new(HashMap::new()),
            connector,
            ctx: Arc::new(deps),
            self_ref: self_ref.clone(),
        })
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.ctx
    }

    /// Return the live session for `instance_id`, building and connecting
    /// one if needed. Concurrent callers for the same id share one build.
    pub async fn get_or_create(&self, instance_id: &str) -> Result<Arc<Session>> {
        if instance_id.trim().is_empty() {
            return Err(Error::Validation("instance id must not be empty".into()));
        }

        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(instance_id.to_string()).or_default())
        };

        match slot.get_or_try_init(|| self.build(instance_id)).await {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                let mut slots = self.slots.lock().await;
                if let Some(current) = slots.get(instance_id)
                    && Arc::ptr_eq(current, &slot)
                    && current.get().is_none()
                {
                    slots.remove(instance_id);
                }
                Err(e)
            },
        }
    }

    async fn build(&self, instance_id: &str) -> Result<Arc<Session>> {
        let account =
            self.ctx
                .accounts
                .get(instance_id)
                .await
                .map_err(|e| Error::SessionCreationFailed {
                    instance_id: instance_id.to_string(),
                    reason: e.to_string(),
                })?;

        let credentials = account.as_ref().map(|a| a.credentials.as_slice());
        let client = self
            .connector
            .client(instance_id, credentials)
            .map_err(|e| Error::SessionCreationFailed {
                instance_id: instance_id.to_string(),
                reason: e.to_string(),
            })?;

        let own_id = account
            .as_ref()
            .and_then(|a| a.owner_id.as_deref())
            .map(Jid::user);
        debug!(instance_id, restored = account.is_some(), "creating session");
        Ok(Session::start(
            instance_id,
            client,
            own_id,
            Arc::clone(&self.ctx),
            self.self_ref.clone(),
        )
        .await)
    }

    /// The live session, if one exists. Never creates.
    pub async fn get(&self, instance_id: &str) -> Option<Arc<Session>> {
        let slots = self.slots.lock().await;
        slots.get(instance_id).and_then(|s| s.get().cloned())
    }

    /// Like [`get_or_create`](Self::get_or_create), but fails unless the
    /// session is connected.
    pub async fn get_authenticated(&self, instance_id: &str) -> Result<Arc<Session>> {
        let session = self.get_or_create(instance_id).await?;
        if session.status().await != SessionStatus::Connected {
            return Err(Error::NotAuthenticated(instance_id.to_string()));
        }
        Ok(session)
    }

    /// Log the instance out and forget it. A session still being built is
    /// waited for and then logged out. Without a session only the stored
    /// account, if any, is dropped.
    pub async fn remove(&self, instance_id: &str) -> Result<()> {
        let slot = self.slots.lock().await.remove(instance_id);
        let session = match slot {
            Some(slot) => match slot.get() {
                Some(session) => Some(Arc::clone(session)),
                None => {
                    debug!(instance_id, "waiting for pending session build");
                    slot.get_or_try_init(|| async { Err(()) })
                        .await
                        .ok()
                        .cloned()
                },
            },
            None => None,
        };
        match session {
            Some(session) => session.logout().await,
            None => {
                if self.ctx.accounts.get(instance_id).await?.is_some() {
                    self.ctx.accounts.delete(instance_id).await?;
                    info!(instance_id, "stored account removed");
                }
                Ok(())
            },
        }
    }

    /// Drop the map entry for `session` if it is still the registered one.
    pub(crate) async fn detach(&self, instance_id: &str, session: &Session) {
        let mut slots = self.slots.lock().await;
        let current = slots
            .get(instance_id)
            .and_then(|s| s.get())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if current {
            slots.remove(instance_id);
            debug!(instance_id, "session detached");
        }
    }

    /// Start a session for every stored account. Returns how many started.
    pub async fn restore(&self) -> Result<usize> {
        let accounts = self.ctx.accounts.list().await?;
        let mut started = 0;
        for account in accounts {
            match self.get_or_create(&account.instance_id).await {
                Ok(_) => started += 1,
                Err(e) => warn!(instance_id = %account.instance_id, error = %e, "failed to restore session"),
            }
        }
        info!(sessions = started, "sessions restored");
        Ok(started)
    }

    /// Live instances and their status, sorted by id.
    pub async fn instances(&self) -> Vec<(String, SessionStatus)> {
        let sessions: Vec<Arc<Session>> = {
            let slots = self.slots.lock().await;
            slots.values().filter_map(|s| s.get().cloned()).collect()
        };
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push((session.instance_id().to_string(), session.status().await));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|s| s.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
