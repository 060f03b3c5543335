//! One tenant's connection and its state machine.
//!
//! ```text
//! Disconnected ──connect──▶ QrPending ──pair──▶ Connected
//!      ▲                                           │
//!      └────────── transient drop (reconnect) ─────┤
//!                                                  ▼
//!                                   LoggedOut (logout / revoked)
//! ```
//!
//! The state lock is held only to read or mutate state; connect, send,
//! upload and logout requests run outside it.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use {
    serde::Serialize,
    tokio::sync::{Mutex, Notify, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    wagate_common::MediaKind,
    wagate_config::ReconnectConfig,
};

use crate::{
    dispatcher::EventDispatcher,
    error::{Error, Result},
    jid::Jid,
    protocol::{
        ContactInfo, OutgoingMessage, PhoneCheck, ProtocolClient, ProtocolEvent, SendReceipt,
        UploadedMedia,
    },
    registry::{SessionDeps, SessionRegistry},
};

/// Capacity of a session's event channel. The protocol layer waits when the
/// dispatcher falls this far behind.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    QrPending,
    Connected,
    LoggedOut,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::LoggedOut => "logged_out",
        }
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.initial_ms),
            max: Duration::from_millis(cfg.max_ms.max(cfg.initial_ms)),
            multiplier: cfg.multiplier,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let ms = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    qr: Option<String>,
    own_id: Option<Jid>,
}

pub struct Session {
    instance_id: String,
    client: Arc<dyn ProtocolClient>,
    state: Mutex<SessionState>,
    events: mpsc::Sender<ProtocolEvent>,
    pub(crate) ctx: Arc<SessionDeps>,
    cancel: CancellationToken,
    reconnect: Notify,
    registry: Weak<SessionRegistry>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a session, start its dispatcher and make the first connection
    /// attempt. A failed attempt is retried in the background.
    pub(crate) async fn start(
        instance_id: &str,
        client: Arc<dyn ProtocolClient>,
        own_id: Option<Jid>,
        ctx: Arc<SessionDeps>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = ctx.shutdown.child_token();
        let session = Arc::new(Self {
            instance_id: instance_id.to_string(),
            client,
            state: Mutex::new(SessionState {
                status: SessionStatus::Disconnected,
                qr: None,
                own_id,
            }),
            events,
            ctx,
            cancel,
            reconnect: Notify::new(),
            registry,
        });

        EventDispatcher::spawn(Arc::clone(&session), rx);
        session.spawn_reconnector();

        if let Err(e) = session.client.connect(session.events.clone()).await {
            warn!(instance_id, error = %e, "initial connect failed, retrying in background");
            session.request_reconnect();
        }
        session
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    /// The tenant's own address, known once paired.
    pub async fn own_id(&self) -> Option<Jid> {
        self.state.lock().await.own_id.clone()
    }

    /// The pairing code to display, while one is pending.
    pub async fn current_qr(&self) -> Result<String> {
        let state = self.state.lock().await;
        match (state.status, &state.qr) {
            (SessionStatus::QrPending, Some(code)) => Ok(code.clone()),
            _ => Err(Error::NotInQrState(self.instance_id.clone())),
        }
    }

    async fn require_connected(&self) -> Result<()> {
        if self.status().await != SessionStatus::Connected {
            return Err(Error::NotConnected(self.instance_id.clone()));
        }
        Ok(())
    }

    /// Send a message. The caller is responsible for persisting it.
    pub async fn send_message(&self, to: &Jid, message: OutgoingMessage) -> Result<SendReceipt> {
        self.require_connected().await?;
        let receipt = self
            .client
            .send_message(to, message)
            .await
            .map_err(Error::SendFailed)?;
        debug!(
            instance_id = %self.instance_id,
            to = %to,
            message_id = %receipt.message_id,
            "message sent"
        );
        Ok(receipt)
    }

    pub async fn upload_media(&self, data: &[u8], kind: MediaKind) -> Result<UploadedMedia> {
        self.require_connected().await?;
        self.client
            .upload(data, kind)
            .await
            .map_err(Error::UploadFailed)
    }

    pub async fn check_phones(&self, phones: &[String]) -> Result<Vec<PhoneCheck>> {
        self.require_connected().await?;
        Ok(self.client.check_phones(phones).await?)
    }

    pub async fn contact_info(&self, jid: &Jid) -> Result<ContactInfo> {
        self.require_connected().await?;
        Ok(self.client.contact_info(jid).await?)
    }

    /// Terminate the session on the server, delete the stored credentials
    /// and leave the registry. Calling it again is a no-op.
    pub async fn logout(&self) -> Result<()> {
        let Some(previous) = self.mark_logged_out().await else {
            debug!(instance_id = %self.instance_id, "already logged out");
            return Ok(());
        };
        info!(instance_id = %self.instance_id, "logging out");
        if previous == SessionStatus::Connected
            && let Err(e) = self.client.logout().await
        {
            warn!(instance_id = %self.instance_id, error = %e, "server logout failed");
        }
        self.dispose().await
    }

    // ── State transitions driven by the dispatcher ──────────────────────────

    /// Returns the previous status if this call made the transition.
    async fn mark_logged_out(&self) -> Option<SessionStatus> {
        let mut state = self.state.lock().await;
        if state.status == SessionStatus::LoggedOut {
            return None;
        }
        let previous = state.status;
        state.status = SessionStatus::LoggedOut;
        state.qr = None;
        Some(previous)
    }

    /// Returns false if the session is already logged out.
    pub(crate) async fn set_qr(&self, code: String) -> bool {
        let mut state = self.state.lock().await;
        if state.status == SessionStatus::LoggedOut {
            return false;
        }
        state.status = SessionStatus::QrPending;
        state.qr = Some(code);
        true
    }

    pub(crate) async fn mark_connected(&self, own_id: Option<Jid>) -> bool {
        let mut state = self.state.lock().await;
        if state.status == SessionStatus::LoggedOut {
            return false;
        }
        state.status = SessionStatus::Connected;
        state.qr = None;
        if own_id.is_some() {
            state.own_id = own_id;
        }
        true
    }

    pub(crate) async fn mark_disconnected(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status == SessionStatus::LoggedOut {
            return false;
        }
        state.status = SessionStatus::Disconnected;
        state.qr = None;
        true
    }

    /// The server revoked the session: same teardown as `logout`, without
    /// asking the server.
    pub(crate) async fn revoked(&self, reason: &str) -> Result<()> {
        if self.mark_logged_out().await.is_none() {
            return Ok(());
        }
        info!(instance_id = %self.instance_id, reason, "logged out by server");
        self.dispose().await
    }

    /// Stop background tasks, release the connection, leave the registry and
    /// drop the stored credentials.
    async fn dispose(&self) -> Result<()> {
        self.cancel.cancel();
        self.client.disconnect().await;
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.instance_id, self).await;
        }
        let existed = self.ctx.accounts.delete(&self.instance_id).await?;
        debug!(instance_id = %self.instance_id, existed, "credentials deleted");
        Ok(())
    }

    // ── Reconnect ───────────────────────────────────────────────────────────

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wake the reconnector. A request made while an attempt is in flight
    /// is kept and handled once that attempt returns.
    pub(crate) fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// One reconnect task per session, alive until the session is disposed
    /// or the process shuts down.
    fn spawn_reconnector(self: &Arc<Self>) {
        let session = Arc::clone(self);
        self.ctx.shutdown.spawn("session-reconnect", async move {
            loop {
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => break,
                    _ = session.reconnect.notified() => {}
                }
                if session.status().await != SessionStatus::Disconnected {
                    continue;
                }
                session.reconnect_loop().await;
            }
            debug!(instance_id = %session.instance_id, "reconnector stopped");
        });
    }

    async fn reconnect_loop(&self) {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.ctx.backoff.delay(attempt);
            debug!(
                instance_id = %self.instance_id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(instance_id = %self.instance_id, "reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if self.status().await == SessionStatus::LoggedOut {
                return;
            }
            match self.client.connect(self.events.clone()).await {
                Ok(()) => {
                    info!(instance_id = %self.instance_id, attempt = attempt + 1, "reconnected");
                    return;
                },
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "reconnect failed");
                    attempt = attempt.saturating_add(1);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wagate_store::AccountStore;

    use super::*;
    use crate::test_support::{Harness, wait_for_status, wait_until};

    #[test]
    fn backoff_grows_and_caps() {
        let b = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            multiplier: 2.0,
        };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_millis(1_000));
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_from_config_never_caps_below_initial() {
        let b = Backoff::from(&ReconnectConfig {
            initial_ms: 500,
            max_ms: 10,
            multiplier: 0.5,
        });
        assert_eq!(b.delay(0), Duration::from_millis(500));
        assert_eq!(b.delay(5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn qr_is_only_available_while_pending() {
        let h = Harness::new().await;
        let session = h.registry.get_or_create("t1").await.unwrap();
        wait_for_status(&session, SessionStatus::QrPending).await;

        let first = session.current_qr().await.unwrap();
        h.client("t1").refresh_qr().await;
        wait_until(|| async { session.current_qr().await.ok() != Some(first.clone()) }).await;
        let second = session.current_qr().await.unwrap();
        assert_ne!(first, second);

        h.client("t1").pair("15550001").await;
        wait_for_status(&session, SessionStatus::Connected).await;
        assert!(matches!(
            session.current_qr().await,
            Err(Error::NotInQrState(_))
        ));
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let h = Harness::new().await;
        let session = h.registry.get_or_create("t1").await.unwrap();
        wait_for_status(&session, SessionStatus::QrPending).await;

        let to = Jid::user("15559999");
        let err = session
            .send_message(&to, OutgoingMessage::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
        assert!(matches!(
            session.upload_media(b"x", MediaKind::Image).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn transport_errors_surface_as_send_failed() {
        let h = Harness::new().await;
        let session = h.paired("t1", "15550001").await;
        h.client("t1").fail_sends(true);

        let err = session
            .send_message(&Jid::user("15559999"), OutgoingMessage::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
    }

    #[tokio::test]
    async fn transient_drop_reconnects() {
        let h = Harness::new().await;
        let session = h.paired("t1", "15550001").await;
        let client = h.client("t1");
        let connects_before = client.connect_count();

        client.fail_next_connects(2);
        client.drop_connection().await;
        wait_for_status(&session, SessionStatus::Disconnected).await;
        wait_for_status(&session, SessionStatus::Connected).await;

        assert_eq!(client.connect_count(), connects_before + 3);
        assert!(h.registry.get("t1").await.is_some());
    }

    #[tokio::test]
    async fn drop_while_reconnect_returns_is_retried() {
        let h = Harness::new().await;
        let session = h.paired("t1", "15550001").await;
        let client = h.client("t1");
        let connects_before = client.connect_count();

        client.set_connect_delay(Duration::from_millis(50));
        client.drop_during_next_connect();
        client.drop_connection().await;

        wait_until(|| async { client.connect_count() == connects_before + 2 }).await;
        wait_for_status(&session, SessionStatus::Connected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.status().await, SessionStatus::Connected);
        assert_eq!(client.connect_count(), connects_before + 2);
    }

    #[tokio::test]
    async fn shutdown_stops_reconnect_loop() {
        let h = Harness::new().await;
        let session = h.paired("t1", "15550001").await;
        let client = h.client("t1");
        let connects_before = client.connect_count();

        client.fail_next_connects(u32::MAX);
        client.drop_connection().await;
        wait_for_status(&session, SessionStatus::Disconnected).await;
        wait_until(|| async { client.connect_count() > connects_before + 1 }).await;

        h.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), h.shutdown.wait())
            .await
            .unwrap();
        assert_eq!(session.status().await, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let h = Harness::new().await;
        let session = h.paired("t1", "15550001").await;
        assert!(h.accounts.get("t1").await.unwrap().is_some());

        session.logout().await.unwrap();
        assert_eq!(session.status().await, SessionStatus::LoggedOut);
        session.logout().await.unwrap();
        assert_eq!(session.status().await, SessionStatus::LoggedOut);

        assert_eq!(h.accounts.deletes(), 1);
        assert_eq!(h.client("t1").logout_count(), 1);
        assert!(h.accounts.get("t1").await.unwrap().is_none());
        assert!(h.registry.get("t1").await.is_none());
    }

    #[tokio::test]
    async fn remote_logout_tears_down() {
        let h = Harness::new().await;
        let session = h.paired("t1", "15550001").await;

        h.client("t1").remote_logout().await;
        wait_for_status(&session, SessionStatus::LoggedOut).await;
        wait_until(|| async { h.registry.get("t1").await.is_none() }).await;

        wait_until(|| async { h.accounts.deletes() == 1 }).await;
        assert_eq!(h.client("t1").logout_count(), 0);
    }
}
