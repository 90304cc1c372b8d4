//! Periodic removal of denied and abandoned requests.

use crate::shutdown::Shutdown;
use selfserve_db::{AccountDb, PendingRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DENIED_GRACE_SECS: i64 = 24 * 60 * 60;
pub const MAX_AGE_SECS: i64 = 90 * 24 * 60 * 60;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
pub const BATCH_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    pub batch_size: u32,
    pub denied_grace_secs: i64,
    pub max_age_secs: i64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: SWEEP_INTERVAL.as_secs(),
            batch_size: BATCH_SIZE,
            denied_grace_secs: DENIED_GRACE_SECS,
            max_age_secs: MAX_AGE_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    DeniedExpired,
    TooOld,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleReason::DeniedExpired => "denied, grace period over",
            StaleReason::TooOld => "exceeded maximum age",
        }
    }
}

/// Why `request` should go, if it should.
pub fn stale_reason(
    request: &PendingRequest,
    now: i64,
    settings: &ReaperSettings,
) -> Option<StaleReason> {
    if let Some(denied_at) = request.denied_at {
        if now - denied_at > settings.denied_grace_secs {
            return Some(StaleReason::DeniedExpired);
        }
    }
    if now - request.created_at > settings.max_age_secs {
        return Some(StaleReason::TooOld);
    }
    None
}

/// Sweep statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// One pass. Delete failures are logged and skipped.
pub async fn reap_once(
    db: &AccountDb,
    now: i64,
    settings: &ReaperSettings,
) -> selfserve_db::Result<SweepStats> {
    let candidates = db
        .stale_candidates(
            now - settings.denied_grace_secs,
            now - settings.max_age_secs,
            settings.batch_size,
        )
        .await?;

    let mut stats = SweepStats {
        examined: candidates.len(),
        ..Default::default()
    };
    for request in &candidates {
        let Some(reason) = stale_reason(request, now, settings) else {
            continue;
        };
        match db.delete_pending(&request.request_id).await {
            Ok(true) => {
                stats.deleted += 1;
                info!(
                    table = db.prefix(),
                    request_id = %request.request_id,
                    reason = reason.as_str(),
                    "Removed stale request"
                );
            }
            Ok(false) => {
                debug!(request_id = %request.request_id, "Stale request already gone");
            }
            Err(e) => {
                stats.failed += 1;
                warn!(
                    table = db.prefix(),
                    request_id = %request.request_id,
                    error = %e,
                    "Could not remove stale request"
                );
            }
        }
    }
    Ok(stats)
}

/// Sweep every `settings.interval_secs` until shutdown. The first pass runs
/// immediately.
pub async fn run_reaper(db: AccountDb, settings: ReaperSettings, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(Duration::from_secs(settings.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!(table = db.prefix(), "Reaper stopping");
                return;
            }
            _ = ticker.tick() => {
                match reap_once(&db, AccountDb::now_secs(), &settings).await {
                    Ok(stats) if stats.deleted > 0 || stats.failed > 0 => {
                        info!(
                            table = db.prefix(),
                            deleted = stats.deleted,
                            failed = stats.failed,
                            "Reaper pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(table = db.prefix(), error = %e, "Reaper pass failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfserve_db::{NewPendingRequest, SubjectFields};

    const NOW: i64 = 1_700_000_000;

    fn new(id: &str, created_at: i64) -> NewPendingRequest {
        NewPendingRequest {
            request_id: id.to_string(),
            token: format!("token-{id}"),
            contact_email: format!("{id}@example.org"),
            scope: "httpd".to_string(),
            fields: SubjectFields::new(),
            created_at,
            origin_ip: "192.0.2.1".to_string(),
        }
    }

    async fn denied(db: &AccountDb, id: &str, denied_at: i64) {
        db.insert_pending(&new(id, NOW - 100)).await.unwrap();
        let token = format!("token-{id}");
        assert!(db.mark_verified(&token).await.unwrap());
        assert!(db.mark_denied(&token, denied_at).await.unwrap());
    }

    #[tokio::test]
    async fn denied_grace_boundary() {
        let db = AccountDb::open_memory("cwiki").await.unwrap();
        let settings = ReaperSettings::default();
        denied(&db, "expired", NOW - DENIED_GRACE_SECS - 1).await;
        denied(&db, "fresh", NOW - DENIED_GRACE_SECS).await;

        let stats = reap_once(&db, NOW, &settings).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(!db.pending_exists("expired").await.unwrap());
        assert!(db.pending_exists("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn max_age_boundary() {
        let db = AccountDb::open_memory("cwiki").await.unwrap();
        let settings = ReaperSettings::default();
        db.insert_pending(&new("ancient", NOW - MAX_AGE_SECS - 1)).await.unwrap();
        db.insert_pending(&new("oldish", NOW - MAX_AGE_SECS)).await.unwrap();
        db.insert_pending(&new("recent", NOW - 10)).await.unwrap();

        let stats = reap_once(&db, NOW, &settings).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(!db.pending_exists("ancient").await.unwrap());
        assert!(db.pending_exists("oldish").await.unwrap());
        assert!(db.pending_exists("recent").await.unwrap());
    }

    #[tokio::test]
    async fn batch_limit_takes_oldest_first() {
        let db = AccountDb::open_memory("jira").await.unwrap();
        let settings = ReaperSettings {
            batch_size: 2,
            ..Default::default()
        };
        for i in 0..3 {
            db.insert_pending(&new(&format!("old{i}"), NOW - MAX_AGE_SECS - 10 + i))
                .await
                .unwrap();
        }
        assert_eq!(reap_once(&db, NOW, &settings).await.unwrap().deleted, 2);
        assert!(db.pending_exists("old2").await.unwrap());
        assert_eq!(reap_once(&db, NOW, &settings).await.unwrap().deleted, 1);
        assert_eq!(db.count_pending().await.unwrap(), 0);
    }

    #[test]
    fn stale_reason_prefers_denial() {
        let settings = ReaperSettings::default();
        let request = PendingRequest {
            request_id: "x".into(),
            token: "t".into(),
            contact_email: "x@example.org".into(),
            scope: "httpd".into(),
            fields: SubjectFields::new(),
            created_at: NOW - MAX_AGE_SECS - 5,
            origin_ip: String::new(),
            state: selfserve_db::RequestState::Verified,
            denied_at: Some(NOW - DENIED_GRACE_SECS - 5),
        };
        assert_eq!(stale_reason(&request, NOW, &settings), Some(StaleReason::DeniedExpired));
        let undenied = PendingRequest {
            denied_at: None,
            ..request
        };
        assert_eq!(stale_reason(&undenied, NOW, &settings), Some(StaleReason::TooOld));
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let db = AccountDb::open_memory("cwiki").await.unwrap();
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(run_reaper(db, ReaperSettings::default(), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        handle.await.unwrap();
    }
}
