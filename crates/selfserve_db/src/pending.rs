//! Pending request operations.

use crate::error::{map_unique, DbError, Result};
use crate::types::*;
use crate::AccountDb;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

const PENDING_COLUMNS: &str =
    "request_id, token, contact_email, scope, fields, created_at, origin_ip, state, denied_at";

impl AccountDb {
    // ========================================================================
    // Inserts and lookups
    // ========================================================================

    /// Store a new request in the `SUBMITTED` state.
    ///
    /// Fails with [`DbError::Constraint`] when the request id or token is
    /// already live.
    pub async fn insert_pending(&self, request: &NewPendingRequest) -> Result<()> {
        let fields = serde_json::to_string(&request.fields)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (request_id, token, contact_email, scope, fields, created_at, origin_ip, state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'SUBMITTED')
            "#,
            self.table("pending")
        ))
        .bind(&request.request_id)
        .bind(&request.token)
        .bind(&request.contact_email)
        .bind(&request.scope)
        .bind(&fields)
        .bind(request.created_at)
        .bind(&request.origin_ip)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, || format!("request {} already pending", request.request_id)))?;

        debug!(request_id = %request.request_id, "Pending request stored");
        Ok(())
    }

    /// Fetch a request by token.
    pub async fn pending_by_token(&self, token: &str) -> Result<Option<PendingRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE token = ?1",
            PENDING_COLUMNS,
            self.table("pending")
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_pending).transpose()
    }

    /// Fetch a request by request id (case-insensitive).
    pub async fn pending_by_request_id(&self, request_id: &str) -> Result<Option<PendingRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE request_id = ?1",
            PENDING_COLUMNS,
            self.table("pending")
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_pending).transpose()
    }

    /// Whether a request id is currently pending.
    pub async fn pending_exists(&self, request_id: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE request_id = ?1 LIMIT 1",
            self.table("pending")
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Whether any live request uses this contact address.
    pub async fn pending_email_exists(&self, email: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE contact_email = ?1 LIMIT 1",
            self.table("pending")
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Number of live requests.
    pub async fn count_pending(&self) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.table("pending")))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ========================================================================
    // Guarded transitions
    // ========================================================================

    /// `SUBMITTED -> VERIFIED`. Returns false when the token is unknown or
    /// was already verified.
    pub async fn mark_verified(&self, token: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET state = 'VERIFIED' WHERE token = ?1 AND state = 'SUBMITTED'",
            self.table("pending")
        ))
        .bind(token)
        .execute(&self.pool)
        .await?;

        let flipped = result.rows_affected() == 1;
        if flipped {
            info!(token, "Request verified");
        }
        Ok(flipped)
    }

    /// Stamp `denied_at` on a verified, not yet denied request. Returns false
    /// when another caller already denied it (or it is gone).
    pub async fn mark_denied(&self, token: &str, denied_at: i64) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET denied_at = ?2
            WHERE token = ?1 AND state = 'VERIFIED' AND denied_at IS NULL
            "#,
            self.table("pending")
        ))
        .bind(token)
        .bind(denied_at)
        .execute(&self.pool)
        .await?;

        let stamped = result.rows_affected() == 1;
        if stamped {
            info!(token, denied_at, "Request denied");
        }
        Ok(stamped)
    }

    /// Remove a verified, undenied request and record its id as provisioned,
    /// in one transaction. Returns false when the row no longer qualifies.
    pub async fn promote_to_known(&self, token: &str, request_id: &str, now: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!(
            r#"
            DELETE FROM {} WHERE token = ?1 AND request_id = ?2
              AND state = 'VERIFIED' AND denied_at IS NULL
            "#,
            self.table("pending")
        ))
        .bind(token)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (request_id, created_at) VALUES (?1, ?2)",
            self.table("users")
        ))
        .bind(request_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(request_id, "Request promoted to known identity");
        Ok(true)
    }

    /// Delete a request by id. Returns whether a row went away.
    pub async fn delete_pending(&self, request_id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE request_id = ?1",
            self.table("pending")
        ))
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Requests denied before `denied_before` or created before
    /// `created_before`, oldest first.
    pub async fn stale_candidates(
        &self,
        denied_before: i64,
        created_before: i64,
        limit: u32,
    ) -> Result<Vec<PendingRequest>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM {}
            WHERE (denied_at IS NOT NULL AND denied_at < ?1) OR created_at < ?2
            ORDER BY created_at ASC
            LIMIT ?3
            "#,
            PENDING_COLUMNS,
            self.table("pending")
        ))
        .bind(denied_before)
        .bind(created_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_pending).collect()
    }
}

fn row_to_pending(row: &SqliteRow) -> Result<PendingRequest> {
    let state_str: String = row.try_get("state")?;
    let state = state_str
        .parse::<RequestState>()
        .map_err(|e| DbError::invalid_state(e.to_string()))?;
    let fields_json: String = row.try_get("fields")?;
    let fields: SubjectFields = serde_json::from_str(&fields_json)?;

    Ok(PendingRequest {
        request_id: row.try_get("request_id")?,
        token: row.try_get("token")?,
        contact_email: row.try_get("contact_email")?,
        scope: row.try_get("scope")?,
        fields,
        created_at: row.try_get("created_at")?,
        origin_ip: row.try_get("origin_ip")?,
        state,
        denied_at: row.try_get("denied_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_request(request_id: &str, token: &str, email: &str) -> NewPendingRequest {
        let mut fields = SubjectFields::new();
        fields.insert("realname".to_string(), "Alice Example".to_string());
        NewPendingRequest {
            request_id: request_id.to_string(),
            token: token.to_string(),
            contact_email: email.to_string(),
            scope: "httpd".to_string(),
            fields,
            created_at: 1_000,
            origin_ip: "192.0.2.1".to_string(),
        }
    }

    async fn db() -> AccountDb {
        AccountDb::open_memory("cwiki").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let db = db().await;
        db.insert_pending(&new_request("alice", "t-1", "alice@example.org"))
            .await
            .unwrap();

        let by_token = db.pending_by_token("t-1").await.unwrap().unwrap();
        assert_eq!(by_token.request_id, "alice");
        assert_eq!(by_token.state, RequestState::Submitted);
        assert_eq!(by_token.field("realname"), "Alice Example");
        assert!(by_token.denied_at.is_none());

        let by_id = db.pending_by_request_id("ALICE").await.unwrap().unwrap();
        assert_eq!(by_id.token, "t-1");
        assert!(db.pending_exists("Alice").await.unwrap());
        assert!(db.pending_email_exists("Alice@Example.org").await.unwrap());
        assert!(db.pending_by_token("t-2").await.unwrap().is_none());
        assert_eq!(db.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_constraint() {
        let db = db().await;
        db.insert_pending(&new_request("alice", "t-1", "a@example.org"))
            .await
            .unwrap();
        let err = db
            .insert_pending(&new_request("ALICE", "t-2", "b@example.org"))
            .await
            .unwrap_err();
        assert!(err.is_constraint());

        let err = db
            .insert_pending(&new_request("bob", "t-1", "b@example.org"))
            .await
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[tokio::test]
    async fn test_verify_flips_once() {
        let db = db().await;
        db.insert_pending(&new_request("alice", "t-1", "a@example.org"))
            .await
            .unwrap();

        assert!(db.mark_verified("t-1").await.unwrap());
        assert!(!db.mark_verified("t-1").await.unwrap());
        assert!(!db.mark_verified("missing").await.unwrap());
        assert!(db.pending_by_token("t-1").await.unwrap().unwrap().is_verified());
    }

    #[tokio::test]
    async fn test_deny_requires_verified_and_is_single_shot() {
        let db = db().await;
        db.insert_pending(&new_request("alice", "t-1", "a@example.org"))
            .await
            .unwrap();

        assert!(!db.mark_denied("t-1", 50).await.unwrap());
        db.mark_verified("t-1").await.unwrap();
        assert!(db.mark_denied("t-1", 50).await.unwrap());
        assert!(!db.mark_denied("t-1", 60).await.unwrap());

        let row = db.pending_by_token("t-1").await.unwrap().unwrap();
        assert_eq!(row.denied_at, Some(50));
    }

    #[tokio::test]
    async fn test_promote_moves_row_to_known() {
        let db = db().await;
        db.insert_pending(&new_request("alice", "t-1", "a@example.org"))
            .await
            .unwrap();

        // Not verified yet
        assert!(!db.promote_to_known("t-1", "alice", 10).await.unwrap());

        db.mark_verified("t-1").await.unwrap();
        assert!(db.promote_to_known("t-1", "alice", 10).await.unwrap());
        assert!(!db.promote_to_known("t-1", "alice", 11).await.unwrap());

        assert!(db.pending_by_token("t-1").await.unwrap().is_none());
        assert!(db.known_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_refuses_denied() {
        let db = db().await;
        db.insert_pending(&new_request("alice", "t-1", "a@example.org"))
            .await
            .unwrap();
        db.mark_verified("t-1").await.unwrap();
        db.mark_denied("t-1", 5).await.unwrap();

        assert!(!db.promote_to_known("t-1", "alice", 10).await.unwrap());
        assert!(db.pending_by_token("t-1").await.unwrap().is_some());
        assert!(!db.known_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_candidates_predicate() {
        let db = db().await;
        let mut old = new_request("old", "t-old", "old@example.org");
        old.created_at = 100;
        let mut fresh = new_request("fresh", "t-fresh", "fresh@example.org");
        fresh.created_at = 5_000;
        let mut denied = new_request("denied", "t-denied", "denied@example.org");
        denied.created_at = 5_000;
        for request in [&old, &fresh, &denied] {
            db.insert_pending(request).await.unwrap();
        }
        db.mark_verified("t-denied").await.unwrap();
        db.mark_denied("t-denied", 4_000).await.unwrap();

        let stale = db.stale_candidates(4_500, 1_000, 1000).await.unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "denied"]);

        let limited = db.stale_candidates(4_500, 1_000, 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        assert!(db.delete_pending("old").await.unwrap());
        assert!(!db.delete_pending("old").await.unwrap());
    }
}
