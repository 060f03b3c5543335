//! In-process protocol backend.
//!
//! Behaves like a real connection from the session's point of view: it emits
//! a pairing code on connect, reconnects with stored credentials, and reports
//! drops and revocations through the event channel. The `SimClient` controls
//! stand in for the phone and the server.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    tokio::sync::mpsc,
    tracing::{debug, warn},
    uuid::Uuid,
    wagate_common::{MediaKind, time::now_secs},
};

use crate::{
    history::HistoryPayload,
    jid::Jid,
    protocol::{
        ContactInfo, Connector, IncomingMessage, OutgoingMessage, PhoneCheck, ProtocolClient,
        ProtocolError, ProtocolEvent, SendReceipt, UploadedMedia,
    },
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn message_id() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("3EB0{}", &hex[..16])
}

/// Builds one [`SimClient`] per session.
#[derive(Default)]
pub struct SimConnector {
    clients: DashMap<String, Arc<SimClient>>,
    builds: DashMap<String, usize>,
    fail_builds: AtomicBool,
    connect_delay: Mutex<Duration>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently built client for `instance_id`.
    pub fn client_for(&self, instance_id: &str) -> Option<Arc<SimClient>> {
        self.clients.get(instance_id).map(|c| Arc::clone(c.value()))
    }

    /// How many clients were built for `instance_id`.
    pub fn builds(&self, instance_id: &str) -> usize {
        self.builds.get(instance_id).map_or(0, |n| *n)
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Connect latency of clients built from now on.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = delay;
    }
}

impl Connector for SimConnector {
    fn client(
        &self,
        instance_id: &str,
        credentials: Option<&[u8]>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(ProtocolError::Credentials("device store unavailable".into()));
        }
        let client = Arc::new(SimClient::new(instance_id, credentials.map(<[u8]>::to_vec)));
        client.set_connect_delay(*lock(&self.connect_delay));
        self.clients
            .insert(instance_id.to_string(), Arc::clone(&client));
        *self.builds.entry(instance_id.to_string()).or_default() += 1;
        debug!(instance_id, restored = credentials.is_some(), "sim client built");
        Ok(client)
    }
}

pub struct SimClient {
    instance_id: String,
    credentials: Mutex<Option<Vec<u8>>>,
    events: Mutex<Option<mpsc::Sender<ProtocolEvent>>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    logouts: AtomicUsize,
    fail_connects: AtomicU32,
    drop_on_connect: AtomicBool,
    connect_delay: Mutex<Duration>,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<(Jid, OutgoingMessage)>>,
    contacts: DashMap<String, ContactInfo>,
}

impl SimClient {
    fn new(instance_id: &str, credentials: Option<Vec<u8>>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            credentials: Mutex::new(credentials),
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            fail_connects: AtomicU32::new(0),
            drop_on_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            contacts: DashMap::new(),
        }
    }

    async fn emit(&self, event: ProtocolEvent) {
        let Some(tx) = lock(&self.events).clone() else {
            debug!(instance_id = %self.instance_id, "no listener, event dropped");
            return;
        };
        if tx.send(event).await.is_err() {
            debug!(instance_id = %self.instance_id, "listener gone, event dropped");
        }
    }

    fn qr_code(&self) -> String {
        format!("2@{},{}", Uuid::new_v4().simple(), self.instance_id)
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    // ── Phone / server controls ─────────────────────────────────────────────

    /// Complete pairing as if `phone` scanned the current code.
    pub async fn pair(&self, phone: &str) {
        let own_id = Jid::user(phone);
        let credentials = format!("sim:{}:{phone}", self.instance_id).into_bytes();
        *lock(&self.credentials) = Some(credentials.clone());
        self.emit(ProtocolEvent::PairSuccess {
            own_id,
            credentials,
        })
        .await;
    }

    /// Replace the pending pairing code.
    pub async fn refresh_qr(&self) {
        let code = self.qr_code();
        self.emit(ProtocolEvent::Qr { code }).await;
    }

    pub async fn rotate_credentials(&self, credentials: Vec<u8>) {
        *lock(&self.credentials) = Some(credentials.clone());
        self.emit(ProtocolEvent::CredentialsUpdated { credentials })
            .await;
    }

    /// Simulate a transient network drop.
    pub async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ProtocolEvent::Disconnected).await;
    }

    /// Simulate the device being unlinked from the phone.
    pub async fn remote_logout(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.credentials) = None;
        self.emit(ProtocolEvent::LoggedOut {
            reason: "device removed".into(),
        })
        .await;
    }

    pub async fn deliver(&self, message: IncomingMessage) {
        self.emit(ProtocolEvent::Message(message)).await;
    }

    pub async fn push_history(&self, history: &HistoryPayload) {
        match history.to_bytes() {
            Ok(payload) => self.push_raw_history(payload).await,
            Err(e) => warn!(instance_id = %self.instance_id, error = %e, "cannot encode history"),
        }
    }

    pub async fn push_raw_history(&self, payload: Vec<u8>) {
        self.emit(ProtocolEvent::HistorySync { payload }).await;
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next successful connect reports a drop right after its
    /// handshake, before `connect` itself returns.
    pub fn drop_during_next_connect(&self) {
        self.drop_on_connect.store(true, Ordering::SeqCst);
    }

    /// Time `connect` spends after its handshake events before returning.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = delay;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_contact(&self, info: ContactInfo) {
        self.contacts.insert(info.jid.clone(), info);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(Jid, OutgoingMessage)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl ProtocolClient for SimClient {
    async fn connect(&self, events: mpsc::Sender<ProtocolEvent>) -> Result<(), ProtocolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProtocolError::Connect("simulated network failure".into()));
        }

        *lock(&self.events) = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        let paired = lock(&self.credentials).is_some();
        if paired {
            self.emit(ProtocolEvent::Connected).await;
        } else {
            self.refresh_qr().await;
        }
        if self.drop_on_connect.swap(false, Ordering::SeqCst) {
            self.drop_connection().await;
        }
        let delay = *lock(&self.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.events) = None;
    }

    async fn send_message(
        &self,
        to: &Jid,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, ProtocolError> {
        self.ensure_connected()?;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Request("simulated send failure".into()));
        }
        lock(&self.sent).push((to.clone(), message));
        Ok(SendReceipt {
            message_id: message_id(),
            timestamp: now_secs(),
        })
    }

    async fn upload(&self, data: &[u8], kind: MediaKind) -> Result<UploadedMedia, ProtocolError> {
        self.ensure_connected()?;
        let token = Uuid::new_v4().simple().to_string();
        Ok(UploadedMedia {
            url: format!("https://mmg.sim.invalid/{kind}/{token}"),
            direct_path: format!("/v/{kind}/{token}"),
            media_key: token.as_bytes().to_vec(),
            file_sha256: Vec::new(),
            file_enc_sha256: Vec::new(),
            file_length: data.len() as u64,
        })
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.credentials) = None;
        Ok(())
    }

    async fn check_phones(&self, phones: &[String]) -> Result<Vec<PhoneCheck>, ProtocolError> {
        self.ensure_connected()?;
        Ok(phones
            .iter()
            .map(|query| match Jid::from_phone(query) {
                Ok(jid) => PhoneCheck {
                    query: query.clone(),
                    jid: Some(jid.to_string()),
                    is_registered: true,
                },
                Err(_) => PhoneCheck {
                    query: query.clone(),
                    jid: None,
                    is_registered: false,
                },
            })
            .collect())
    }

    async fn contact_info(&self, jid: &Jid) -> Result<ContactInfo, ProtocolError> {
        self.ensure_connected()?;
        let key = jid.to_string();
        Ok(self
            .contacts
            .get(&key)
            .map(|c| c.value().clone())
            .unwrap_or(ContactInfo {
                jid: key,
                name: None,
                status: None,
                picture_url: None,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_client_offers_a_qr_code() {
        let connector = SimConnector::new();
        let client = connector.client("t1", None).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        client.connect(tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProtocolEvent::Qr { .. })));
        assert_eq!(connector.builds("t1"), 1);
    }

    #[tokio::test]
    async fn stored_credentials_connect_directly() {
        let connector = SimConnector::new();
        let client = connector.client("t1", Some(b"creds")).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        client.connect(tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ProtocolEvent::Connected)));
    }

    #[tokio::test]
    async fn scheduled_failures_are_consumed() {
        let connector = SimConnector::new();
        connector.client("t1", Some(b"c")).unwrap();
        let sim = connector.client_for("t1").unwrap();
        sim.fail_next_connects(1);
        let (tx, _rx) = mpsc::channel(8);
        assert!(sim.connect(tx.clone()).await.is_err());
        assert!(sim.connect(tx).await.is_ok());
        assert_eq!(sim.connect_count(), 2);
    }

    #[tokio::test]
    async fn requests_need_a_connection() {
        let connector = SimConnector::new();
        let client = connector.client("t1", None).unwrap();
        let err = client
            .send_message(&Jid::user("1555"), OutgoingMessage::Text("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected));
    }

    #[test]
    fn message_ids_look_native() {
        let id = message_id();
        assert!(id.starts_with("3EB0"));
        assert_eq!(id.len(), 20);
        assert_ne!(id, message_id());
    }
}
