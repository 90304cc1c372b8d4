//! Record store for one request kind.
//!
//! Each downstream system gets its own database file holding three tables
//! named after the kind's prefix:
//!
//! - `<prefix>_pending`: live requests (submitted or verified, maybe denied)
//! - `<prefix>_users`: identities already provisioned by an approval
//! - `<prefix>_blocked`: projects that do not use this system
//!
//! Every state-guarding mutation is a single conditional statement, so two
//! tasks racing on the same token cannot both observe success.
//!
//! # Usage
//!
//! ```rust,ignore
//! use selfserve_db::AccountDb;
//!
//! let db = AccountDb::open("/var/lib/selfserve/confluence.db", "cwiki").await?;
//! if db.mark_verified(&token).await? {
//!     // notify reviewers
//! }
//! ```

mod error;
mod identities;
mod pending;
mod schema;
mod types;

pub use error::{DbError, Result};
pub use types::*;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Record store for a single request kind.
#[derive(Clone)]
pub struct AccountDb {
    pool: SqlitePool,
    prefix: String,
}

impl AccountDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self {
            pool,
            prefix: prefix.to_string(),
        };
        db.ensure_schema().await?;

        info!(path = %path.display(), prefix, "Record store opened");

        Ok(db)
    }

    /// In-memory store (tests, dry runs). Single connection so all
    /// callers share the same database.
    pub async fn open_memory(prefix: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self {
            pool,
            prefix: prefix.to_string(),
        };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Table prefix of this kind.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    pub(crate) fn table(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }
}

// Timestamp utilities
impl AccountDb {
    /// Current time as seconds since Unix epoch.
    pub fn now_secs() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Prefixes are spliced into SQL, so only `[a-z][a-z0-9_]*` is accepted.
fn validate_prefix(prefix: &str) -> Result<()> {
    let mut chars = prefix.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_lowercase()
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!("bad table prefix: {:?}", prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("confluence.db");

        let db = AccountDb::open(&db_path, "cwiki").await.unwrap();
        assert!(db_path.exists());
        assert_eq!(db.prefix(), "cwiki");

        db.close().await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("jira.db");

        let db = AccountDb::open(&db_path, "jira").await.unwrap();
        db.insert_known("alice", 1).await.unwrap();
        db.close().await;

        let db = AccountDb::open(&db_path, "jira").await.unwrap();
        assert!(db.known_exists("ALICE").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_prefix() {
        for prefix in ["", "1abc", "users; DROP TABLE x", "Cwiki", "a-b"] {
            let err = AccountDb::open_memory(prefix).await.err().unwrap();
            assert!(matches!(err, DbError::InvalidInput(_)), "{prefix}");
        }
    }
}
