//! Config schema types (server, database, queue, history sync, reconnect,
//! media, protocol backend).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WagateConfig {
    /// Root of every default path. Defaults to `~/.wagate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub history: HistoryConfig,
    pub reconnect: ReconnectConfig,
    pub media: MediaConfig,
    pub whatsapp: WhatsAppConfig,
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8900,
        }
    }
}

/// Account and message storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL. Defaults to `<data_dir>/wagate.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl DatabaseConfig {
    pub fn resolve_url(&self, data_dir: &std::path::Path) -> String {
        self.url.clone().unwrap_or_else(|| {
            format!("sqlite://{}?mode=rwc", data_dir.join("wagate.db").display())
        })
    }
}

/// History sync queue location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory of the sled database. Defaults to `<data_dir>/queue`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Name of the channel shared by every instance.
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: None,
            name: "history_sync".into(),
        }
    }
}

impl QueueConfig {
    pub fn resolve_path(&self, data_dir: &std::path::Path) -> PathBuf {
        self.path.clone().unwrap_or_else(|| data_dir.join("queue"))
    }
}

/// History sync worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// How long the worker sleeps when the queue is empty or unreachable.
    pub poll_interval_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
        }
    }
}

impl HistoryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Session reconnect backoff. Retries never stop on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Where media attached to sent messages is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Defaults to `<data_dir>/media`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl MediaConfig {
    pub fn resolve_dir(&self, data_dir: &std::path::Path) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| data_dir.join("media"))
    }
}

/// Which protocol backend sessions connect through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolBackend {
    /// WhatsApp Web multi-device. Needs a build with the `whatsapp-web`
    /// feature.
    #[default]
    Web,
    /// In-process simulator; no traffic leaves the process.
    Sim,
}

impl ProtocolBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Sim => "sim",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub backend: ProtocolBackend,
    /// Per-instance device stores of the web backend. Defaults to
    /// `<data_dir>/devices`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices_dir: Option<PathBuf>,
}

impl WhatsAppConfig {
    pub fn resolve_devices_dir(&self, data_dir: &std::path::Path) -> PathBuf {
        self.devices_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("devices"))
    }
}
