//! Table creation for one request kind.
//!
//! All CREATE TABLE statements live here.

use crate::error::Result;
use crate::AccountDb;
use tracing::info;

impl AccountDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL for concurrent readers while the reaper deletes
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        // Provisioned identities (append-only)
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {users} (
                request_id TEXT NOT NULL COLLATE NOCASE PRIMARY KEY,
                created_at INTEGER NOT NULL DEFAULT 0
            )"#,
            users = self.table("users"),
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {pending} (
                request_id TEXT NOT NULL COLLATE NOCASE PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                contact_email TEXT NOT NULL COLLATE NOCASE,
                scope TEXT NOT NULL COLLATE NOCASE,
                fields TEXT NOT NULL DEFAULT '{{}}',
                created_at INTEGER NOT NULL,
                origin_ip TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'SUBMITTED'
                    CHECK (state IN ('SUBMITTED', 'VERIFIED')),
                denied_at INTEGER
            )"#,
            pending = self.table("pending"),
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{pending}_email ON {pending}(contact_email)",
            pending = self.table("pending"),
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{pending}_created ON {pending}(created_at)",
            pending = self.table("pending"),
        ))
        .execute(&self.pool)
        .await?;

        // Externally managed denylist
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {blocked} (
                scope TEXT NOT NULL COLLATE NOCASE PRIMARY KEY
            )"#,
            blocked = self.table("blocked"),
        ))
        .execute(&self.pool)
        .await?;

        info!(prefix = %self.prefix, "Record store schema verified");
        Ok(())
    }
}
