//! Types and process plumbing shared by every wagate crate.

pub mod shutdown;
pub mod time;
pub mod types;

pub use {
    shutdown::Shutdown,
    types::{MediaKind, UnknownMediaKind},
};
