//! Authenticated caller.

use serde::{Deserialize, Serialize};

/// Capability value for the person (or service) behind a request.
///
/// Built by the front end from the session; the engine only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    /// Projects the actor commits to
    #[serde(default)]
    pub projects: Vec<String>,
    /// Projects whose PMC the actor sits on
    #[serde(default)]
    pub pmcs: Vec<String>,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub is_chair: bool,
    #[serde(default)]
    pub is_role_account: bool,
}

impl Actor {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Default::default()
        }
    }

    /// Reviewers must be on the request's project, or root.
    pub fn can_review(&self, scope: &str) -> bool {
        self.is_root || self.projects.iter().any(|p| p.eq_ignore_ascii_case(scope))
    }

    pub fn is_pmc_member(&self) -> bool {
        self.is_root || !self.pmcs.is_empty()
    }

    pub fn on_pmc(&self, project: &str) -> bool {
        self.pmcs.iter().any(|p| p.eq_ignore_ascii_case(project))
    }

    /// Address used for requester notifications.
    pub fn address(&self, mail_domain: &str) -> String {
        format!("{}@{}", self.uid, mail_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_requires_project_or_root() {
        let mut actor = Actor::new("alice");
        actor.projects = vec!["httpd".to_string()];
        assert!(actor.can_review("httpd"));
        assert!(actor.can_review("HTTPD"));
        assert!(!actor.can_review("kafka"));

        actor.is_root = true;
        assert!(actor.can_review("kafka"));
    }

    #[test]
    fn pmc_membership() {
        let mut actor = Actor::new("bob");
        assert!(!actor.is_pmc_member());
        actor.pmcs = vec!["tomcat".to_string()];
        assert!(actor.is_pmc_member());
        assert!(actor.on_pmc("tomcat"));
        assert!(!actor.on_pmc("httpd"));
    }
}
