//! Known projects, their mail domains and existing mailing lists.
//!
//! Readers take an `Arc` of the current snapshot; the refresh loop builds a
//! complete new snapshot and swaps it in, so a reader never sees a half
//! updated view.

use crate::shutdown::Shutdown;
use crate::source::DataSource;
use anyhow::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Committee-info document (`{"committees": {"httpd": {"mail_list": "httpd"}}}`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitteeInfo {
    #[serde(default)]
    pub committees: HashMap<String, CommitteeEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitteeEntry {
    #[serde(default)]
    pub mail_list: Option<String>,
}

/// Immutable view of the reference data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    pub projects: BTreeSet<String>,
    /// Project (or base key) to mail host, e.g. `httpd -> httpd.apache.org`
    pub mail_domains: BTreeMap<String, String>,
    /// Existing lists as `list@domain`
    pub mailing_lists: BTreeSet<String>,
}

impl ProjectSnapshot {
    /// Build from committee info plus locally configured projects.
    ///
    /// `base_domains` seeds the mapping (`foundation -> apache.org`);
    /// each project maps to `<mail_list>.<mail_suffix>`.
    pub fn build(
        info: &CommitteeInfo,
        extra_projects: &[String],
        base_domains: &BTreeMap<String, String>,
        mail_suffix: &str,
    ) -> Self {
        let mut projects: BTreeSet<String> = info.committees.keys().cloned().collect();
        projects.extend(extra_projects.iter().cloned());

        let mut mail_domains = base_domains.clone();
        for project in &projects {
            let host = info
                .committees
                .get(project)
                .and_then(|c| c.mail_list.clone())
                .unwrap_or_else(|| project.clone());
            mail_domains.insert(project.clone(), format!("{}.{}", host, mail_suffix));
        }

        Self {
            projects,
            mail_domains,
            mailing_lists: BTreeSet::new(),
        }
    }
}

/// Shared, swap-on-refresh holder of the current [`ProjectSnapshot`].
#[derive(Debug)]
pub struct ProjectRegistry {
    current: RwLock<Arc<ProjectSnapshot>>,
    mail_suffix: String,
}

impl ProjectRegistry {
    pub fn new(snapshot: ProjectSnapshot, mail_suffix: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            mail_suffix: mail_suffix.into(),
        }
    }

    pub fn snapshot(&self) -> Arc<ProjectSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, snapshot: ProjectSnapshot) {
        let fresh = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Keep projects and domains, swap the list of existing lists.
    pub fn replace_mailing_lists(&self, lists: BTreeSet<String>) {
        let mut next = (*self.snapshot()).clone();
        next.mailing_lists = lists;
        self.replace(next);
    }

    pub fn is_known_project(&self, project: &str) -> bool {
        self.snapshot().projects.contains(project)
    }

    pub fn mail_domain(&self, project: &str) -> Option<String> {
        self.snapshot().mail_domains.get(project).cloned()
    }

    pub fn is_mail_domain(&self, domain: &str) -> bool {
        self.snapshot().mail_domains.values().any(|d| d == domain)
    }

    pub fn list_exists(&self, address: &str) -> bool {
        self.snapshot().mailing_lists.contains(address)
    }

    /// Private list of a project, e.g. `private@httpd.apache.org`.
    pub fn private_list(&self, project: &str) -> String {
        match self.mail_domain(project) {
            Some(domain) => format!("private@{}", domain),
            None => format!("private@{}.{}", project, self.mail_suffix),
        }
    }
}

// ============================================================================
// Refresh
// ============================================================================

/// Periodically rebuilds the registry from its sources.
pub struct ProjectRefresher {
    pub registry: Arc<ProjectRegistry>,
    pub committee_info: Option<DataSource>,
    pub mailing_lists: Option<DataSource>,
    pub extra_projects: Vec<String>,
    pub base_domains: BTreeMap<String, String>,
    pub mail_suffix: String,
    pub client: reqwest::Client,
}

impl ProjectRefresher {
    /// One refresh. A failing source leaves its part of the snapshot as it was.
    pub async fn refresh_once(&self) -> Result<()> {
        let previous = self.registry.snapshot();

        let mut next = match &self.committee_info {
            Some(source) => {
                let info: CommitteeInfo = source.fetch_json(&self.client).await?;
                ProjectSnapshot::build(&info, &self.extra_projects, &self.base_domains, &self.mail_suffix)
            }
            None => ProjectSnapshot::build(
                &CommitteeInfo::default(),
                &self.extra_projects,
                &self.base_domains,
                &self.mail_suffix,
            ),
        };

        next.mailing_lists = match &self.mailing_lists {
            Some(source) => match source.fetch_json::<Vec<String>>(&self.client).await {
                Ok(lists) => lists.into_iter().collect(),
                Err(e) => {
                    warn!(source = %source, error = %e, "Could not refresh mailing lists");
                    previous.mailing_lists.clone()
                }
            },
            None => previous.mailing_lists.clone(),
        };

        info!(
            projects = next.projects.len(),
            lists = next.mailing_lists.len(),
            "Project registry refreshed"
        );
        self.registry.replace(next);
        Ok(())
    }

    pub async fn run(self, interval: Duration, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(error = %e, "Project refresh failed, retrying next interval");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    }
}

/// Default base domain keys.
pub fn default_base_domains() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("foundation".to_string(), "apache.org".to_string());
    map.insert("apachecon".to_string(), "apachecon.com".to_string());
    map
}
