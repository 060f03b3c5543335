//! Account and message persistence.
//!
//! Both stores are async traits so the session layer never depends on a
//! concrete database; the shipped implementations share one SQLite pool.

pub mod accounts;
pub mod error;
pub mod messages;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub use {
    accounts::{Account, AccountStore, SqliteAccountStore},
    error::{Result, StoreError},
    messages::{MessageRecord, MessageStore, SqliteMessageStore},
};

/// Open (creating if needed) the database at `url` and create both tables.
pub async fn open(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    init(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with both tables created.
///
/// One connection only: every new SQLite memory connection is a fresh,
/// empty database.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init(&pool).await?;
    Ok(pool)
}

/// Create the `accounts` and `messages` tables if they don't exist.
pub async fn init(pool: &SqlitePool) -> Result<()> {
    SqliteAccountStore::init(pool).await?;
    SqliteMessageStore::init(pool).await?;
    Ok(())
}
