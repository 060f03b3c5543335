//! History sync queue: one named, durable FIFO shared by every session
//! (producers) and the history sync worker (consumer).
//!
//! Popping removes the item in the same backend operation that returns it.
//! There is no acknowledgement and no redelivery: a consumer that dies after
//! `pop` loses the item.

pub mod backend;
pub mod durable;
pub mod error;
pub mod queue;

pub use {
    backend::{MemoryBackend, QueueBackend},
    durable::SledBackend,
    error::{QueueError, Result},
    queue::{HistorySyncItem, HistorySyncQueue},
};
