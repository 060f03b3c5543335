//! Gateway: HTTP surface over the session registry.
//!
//! Lifecycle:
//! 1. Load config, resolve the data dir
//! 2. Open the account/message stores and the history sync queue
//! 3. Restore stored instances, start the history sync worker
//! 4. Serve `/api/{instance_id}/…` until ctrl-c, then drain background tasks

pub mod error;
pub mod media;
pub mod qr;
pub mod routes;
pub mod server;
pub mod state;

pub use {
    error::{ApiError, ApiResult},
    routes::build_router,
    server::{Gateway, start_gateway},
    state::AppState,
};
