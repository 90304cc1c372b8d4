//! Per-system configuration of the request engine.
//!
//! One [`RequestKind`] value describes everything that differs between
//! downstream systems: names used in messages and thread keys, the table
//! prefix, the administration command and how its output is classified.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_ACLI: &str = "/opt/latest-cli/acli.sh";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const ACTIVE_MARKER: &str = "\"active\":true";

pub(crate) fn default_program() -> String {
    DEFAULT_ACLI.to_string()
}

pub(crate) fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_noun() -> String {
    "account".to_string()
}

/// A conflict marker found in the command's stderr or stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Substring, or regex when `regex` is set
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    /// User-facing message when the marker is found
    pub message: String,
}

/// How a finished command maps to an outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRules {
    /// Markers meaning the job was done despite a non-zero exit
    #[serde(default)]
    pub soft_success: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRule>,
    /// Generic failure message; derived from the display name when absent
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub timeout_message: Option<String>,
}

/// Configuration of one request type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestKind {
    /// URL and thread-key slug, e.g. `confluence`
    pub name: String,
    /// Name used in user-facing messages, e.g. `Confluence`
    pub display_name: String,
    /// Prefix of the record store tables
    pub table_prefix: String,
    /// What the system is, for the blocked-project message ("wiki")
    #[serde(default = "default_noun")]
    pub system_noun: String,
    #[serde(default = "default_program")]
    pub program: String,
    /// Argument template for account creation. `{userid}`, `{realname}`
    /// and `{email}` are replaced per argument.
    pub create_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub outcomes: OutcomeRules,
    /// Extra template variables passed to every notification
    #[serde(default)]
    pub template_vars: BTreeMap<String, String>,
}

impl RequestKind {
    /// Confluence wiki accounts.
    pub fn confluence() -> Self {
        Self::acli_preset("confluence", "Confluence", "cwiki", "wiki")
    }

    /// Jira issue tracker accounts.
    pub fn jira() -> Self {
        Self::acli_preset("jira", "Jira", "jira", "issue tracker")
    }

    fn acli_preset(name: &str, display: &str, prefix: &str, noun: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display.to_string(),
            table_prefix: prefix.to_string(),
            system_noun: noun.to_string(),
            program: default_program(),
            create_args: [
                name,
                "-v",
                "--action",
                "addUser",
                "--userId",
                "{userid}",
                "--userFullName",
                "{realname}",
                "--userEmail",
                "{email}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            outcomes: OutcomeRules {
                soft_success: Vec::new(),
                conflicts: vec![
                    ConflictRule {
                        pattern: "A user with that username already exists".to_string(),
                        regex: false,
                        message: format!("An account with this username already exists in {}", display),
                    },
                    ConflictRule {
                        pattern: r"Client error: User '.+?' is already defined\.".to_string(),
                        regex: true,
                        message: format!(
                            "The {} backend was unable to create this account due to a naming conflict. \
                             Please contact infrastructure and have them create the account.",
                            display
                        ),
                    },
                ],
                failure_message: None,
                timeout_message: None,
            },
            template_vars: BTreeMap::new(),
        }
    }

    /// Reactivation command for an existing account.
    pub fn activate_args(&self, userid: &str, email: &str) -> Vec<String> {
        vec![
            self.program.clone(),
            self.name.clone(),
            "-v".to_string(),
            "--action".to_string(),
            "updateUser".to_string(),
            "--userId".to_string(),
            userid.to_string(),
            "--userEmail".to_string(),
            email.to_string(),
            "--activate".to_string(),
        ]
    }

    /// Rules for reactivation: the JSON `"active":true` marker counts as
    /// success even when the tool exits non-zero.
    pub fn activate_outcomes(&self) -> OutcomeRules {
        OutcomeRules {
            soft_success: vec![ACTIVE_MARKER.to_string()],
            conflicts: Vec::new(),
            failure_message: Some(format!(
                "{} account reactivation failed due to an internal server error.",
                self.display_name
            )),
            timeout_message: None,
        }
    }

    /// Full argv for account creation, program first.
    pub fn create_argv(&self, userid: &str, realname: &str, email: &str) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.create_args.iter().map(|arg| {
                arg.replace("{userid}", userid)
                    .replace("{realname}", realname)
                    .replace("{email}", email)
            }))
            .collect()
    }

    pub fn failure_message(&self) -> String {
        self.outcomes.failure_message.clone().unwrap_or_else(|| {
            format!(
                "{} account creation failed due to an internal server error.",
                self.display_name
            )
        })
    }

    pub fn timeout_message(&self) -> String {
        self.outcomes.timeout_message.clone().unwrap_or_else(|| {
            format!(
                "{} did not respond in time. The request was kept, please try again later.",
                self.display_name
            )
        })
    }

    // ------------------------------------------------------------------
    // Notification naming
    // ------------------------------------------------------------------

    pub fn template(&self, suffix: &str) -> String {
        format!("{}_account_{}.txt", self.name, suffix)
    }

    /// Thread shared by all mails to the requester.
    pub fn user_thread(&self, token: &str) -> String {
        format!("{}account-user-{}", self.name, token)
    }

    /// Thread shared by all mails to reviewers.
    pub fn pmc_thread(&self, token: &str) -> String {
        format!("{}account-pmc-{}", self.name, token)
    }

    pub fn activate_thread(&self, token: &str) -> String {
        format!("{}-activate-{}", self.name, token)
    }

    pub fn verify_url(&self, host: &str, token: &str) -> String {
        format!("https://{}/{}-account-verify.html?{}", host, self.name, token)
    }

    pub fn review_url(&self, host: &str, token: &str) -> String {
        format!("https://{}/{}-account-review.html?token={}", host, self.name, token)
    }

    pub fn reactivate_url(&self, host: &str, token: &str) -> String {
        format!("https://{}/{}-account-reactivate.html?{}", host, self.name, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_argv_substitutes_per_argument() {
        let kind = RequestKind::confluence();
        let argv = kind.create_argv("alice", "Alice O'Brien; rm -rf /", "alice@example.org");
        assert_eq!(argv[0], DEFAULT_ACLI);
        assert_eq!(argv[1], "confluence");
        assert!(argv.contains(&"alice".to_string()));
        // the whole name stays one argument
        assert!(argv.contains(&"Alice O'Brien; rm -rf /".to_string()));
        assert_eq!(argv.len(), 11);
    }

    #[test]
    fn naming_follows_kind() {
        let kind = RequestKind::jira();
        assert_eq!(kind.template("verify"), "jira_account_verify.txt");
        assert_eq!(kind.user_thread("t"), "jiraaccount-user-t");
        assert_eq!(kind.pmc_thread("t"), "jiraaccount-pmc-t");
        assert_eq!(
            kind.review_url("selfserve.example.org", "t"),
            "https://selfserve.example.org/jira-account-review.html?token=t"
        );
        assert_eq!(
            kind.failure_message(),
            "Jira account creation failed due to an internal server error."
        );
    }

    #[test]
    fn kind_deserializes_with_defaults() {
        let kind: RequestKind = serde_json::from_str(
            r#"{
                "name": "wiki",
                "display_name": "Wiki",
                "table_prefix": "wiki",
                "create_args": ["add", "{userid}"]
            }"#,
        )
        .unwrap();
        assert_eq!(kind.program, DEFAULT_ACLI);
        assert_eq!(kind.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(kind.system_noun, "account");
        assert!(kind.outcomes.conflicts.is_empty());
    }
}
