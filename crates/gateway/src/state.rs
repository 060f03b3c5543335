use std::{sync::Arc, time::Duration};

use wagate_whatsapp::{Outbound, SessionRegistry};

/// How long `GET qrcode` waits for a freshly created session to produce its
/// first pairing code.
pub const DEFAULT_QR_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub outbound: Arc<Outbound>,
    pub qr_wait: Duration,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, outbound: Arc<Outbound>) -> Self {
        Self {
            registry,
            outbound,
            qr_wait: DEFAULT_QR_WAIT,
        }
    }

    pub fn with_qr_wait(mut self, wait: Duration) -> Self {
        self.qr_wait = wait;
        self
    }
}
