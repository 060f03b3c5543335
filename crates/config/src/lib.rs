//! Configuration: schema, discovery and loading.
//!
//! Config files are looked up as `wagate.{toml,yaml,yml,json}` in the working
//! directory, then in `~/.config/wagate/`. String values may reference
//! environment variables as `${NAME}`. [`Layout`] turns a loaded config into
//! the concrete paths of the database, queue, media and device stores.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{ConfigLocator, Layout, load_config},
    schema::{
        DatabaseConfig, HistoryConfig, MediaConfig, ProtocolBackend, QueueConfig,
        ReconnectConfig, ServerConfig, WagateConfig, WhatsAppConfig,
    },
};
