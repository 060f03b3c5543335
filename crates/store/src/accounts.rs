//! Account store: one credential blob per instance.

use {async_trait::async_trait, serde::Serialize, wagate_common::time::now_ms};

use crate::error::Result;

/// A paired (or pairing) instance and its device credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub instance_id: String,
    /// The tenant's own identifier, known once pairing succeeded.
    pub owner_id: Option<String>,
    #[serde(skip)]
    pub credentials: Vec<u8>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, instance_id: &str) -> Result<Option<Account>>;

    async fn list(&self) -> Result<Vec<Account>>;

    /// Insert or overwrite the credential blob. A `None` owner keeps the
    /// stored one.
    async fn upsert(
        &self,
        instance_id: &str,
        owner_id: Option<&str>,
        credentials: &[u8],
    ) -> Result<()>;

    /// Returns whether a record existed.
    async fn delete(&self, instance_id: &str) -> Result<bool>;
}

/// SQLite-backed account store.
pub struct SqliteAccountStore {
    pool: sqlx::SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    instance_id: String,
    owner_id: Option<String>,
    credentials: Vec<u8>,
    created_at: i64,
    updated_at: i64,
}

impl From<AccountRow> for Account {
    fn from(r: AccountRow) -> Self {
        Self {
            instance_id: r.instance_id,
            owner_id: r.owner_id,
            credentials: r.credentials,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl SqliteAccountStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `accounts` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS accounts (
                instance_id TEXT PRIMARY KEY,
                owner_id    TEXT,
                credentials BLOB NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self) -> Result<Vec<Account>> {
        let rows =
            sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert(
        &self,
        instance_id: &str,
        owner_id: Option<&str>,
        credentials: &[u8],
    ) -> Result<()> {
        let now = now_ms() as i64;
        sqlx::query(
            r#"INSERT INTO accounts (instance_id, owner_id, credentials, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 owner_id = COALESCE(excluded.owner_id, accounts.owner_id),
                 credentials = excluded.credentials,
                 updated_at = excluded.updated_at"#,
        )
        .bind(instance_id)
        .bind(owner_id)
        .bind(credentials)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM accounts WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}
