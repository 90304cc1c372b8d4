//! Known identities and blocked scopes.

use crate::error::Result;
use crate::AccountDb;
use sqlx::Row;
use tracing::info;

impl AccountDb {
    // ========================================================================
    // Known identities
    // ========================================================================

    /// Whether the id was already provisioned (case-insensitive).
    pub async fn known_exists(&self, request_id: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE request_id = ?1 LIMIT 1",
            self.table("users")
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Record a provisioned id. Returns false if it was already present.
    pub async fn insert_known(&self, request_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (request_id, created_at) VALUES (?1, ?2)",
            self.table("users")
        ))
        .bind(request_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Bulk import of ids that exist downstream already. Returns the number
    /// of new rows.
    pub async fn import_known<I, S>(&self, ids: I, now: i64) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (request_id, created_at) VALUES (?1, ?2)",
            self.table("users")
        );
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() {
                continue;
            }
            let result = sqlx::query(&sql).bind(id).bind(now).execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        info!(prefix = %self.prefix, inserted, "Imported known identities");
        Ok(inserted)
    }

    // ========================================================================
    // Blocked scopes
    // ========================================================================

    pub async fn scope_blocked(&self, scope: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE scope = ?1 LIMIT 1",
            self.table("blocked")
        ))
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Returns false if the scope was already blocked.
    pub async fn block_scope(&self, scope: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (scope) VALUES (?1)",
            self.table("blocked")
        ))
        .bind(scope)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns false if the scope was not blocked.
    pub async fn unblock_scope(&self, scope: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE scope = ?1", self.table("blocked")))
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_blocked(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SELECT scope FROM {} ORDER BY scope",
            self.table("blocked")
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("scope").map_err(Into::into))
            .collect()
    }
}
