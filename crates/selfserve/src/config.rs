//! Portal configuration, read from a TOML file.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1"
//! port = 8080
//! public_host = "selfserve.apache.org"
//! error_reporting = "journal"
//! max_form_size = "100mb"
//! rate_limit_per_ip = 50
//! trusted_proxies = ["127.0.0.1"]
//!
//! [storage]
//! db_dir = "/var/lib/selfserve/db"
//! queue_dir = "/var/lib/selfserve/queue"
//!
//! [messaging]
//! sender = "ASF Self-Service Platform <selfserve@apache.org>"
//! template_dir = "templates"
//! sendmail = "/usr/sbin/sendmail"
//!
//! [[accounts]]
//! preset = "confluence"
//!
//! [reactivation.confluence]
//! directory = "/var/lib/selfserve/cwiki-users.json"
//!
//! [resources]
//! protected_spaces = ["INFRA", "INCUBATOR", "COMDEV"]
//! jira_scheme_files = { workflow = "/x1/acli/site/js/jiraworkflowschemes.json" }
//! ```

use selfserve_engine::projects::default_base_domains;
use selfserve_engine::{OutcomeRules, ReaperSettings, RequestKind, ResourceSettings};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "selfserve.toml";
const MIN_FORM_SIZE: u64 = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortalConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub reactivation: BTreeMap<String, ReactivationConfig>,
    #[serde(default)]
    pub reaper: ReaperSettings,
    /// Space and project administration
    #[serde(default)]
    pub resources: ResourceSettings,
}

/// What an internal failure looks like to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorReporting {
    /// Error detail goes back to the caller
    #[default]
    Show,
    /// Error detail goes to the log; the caller gets a correlation id
    Journal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host name used in mailed links
    pub public_host: String,
    #[serde(default)]
    pub error_reporting: ErrorReporting,
    #[serde(default = "default_max_form_size", deserialize_with = "deserialize_size")]
    pub max_form_size: u64,
    /// Requests per client address per day; 0 disables limiting
    #[serde(default)]
    pub rate_limit_per_ip: u32,
    /// Peers allowed to name the client in `X-Forwarded-For`
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub db_dir: PathBuf,
    pub queue_dir: PathBuf,
    /// Command audit logs; defaults to `db_dir`
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn audit_dir(&self) -> &Path {
        self.audit_dir.as_deref().unwrap_or(&self.db_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessagingConfig {
    pub sender: String,
    pub template_dir: PathBuf,
    #[serde(default = "default_notification_target")]
    pub notification_target: String,
    /// Path to sendmail; mail is only logged when unset
    #[serde(default)]
    pub sendmail: Option<PathBuf>,
    #[serde(default = "default_mail_domain")]
    pub mail_domain: String,
    #[serde(default)]
    pub message_id_domain: Option<String>,
    #[serde(default)]
    pub slack_url: Option<String>,
    #[serde(default)]
    pub slack_token: Option<String>,
    #[serde(default)]
    pub slack_channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectsConfig {
    /// committee-info JSON (file or URL)
    #[serde(default)]
    pub committee_info: Option<String>,
    /// JSON array of existing list addresses (file or URL)
    #[serde(default)]
    pub mailing_lists: Option<String>,
    #[serde(default = "default_project_refresh")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_extra_projects")]
    pub extra: Vec<String>,
    #[serde(default = "default_base_domains")]
    pub base_domains: BTreeMap<String, String>,
    /// External userid registry consulted by the `-exists` lookups
    #[serde(default)]
    pub userid_registry: Option<String>,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            committee_info: None,
            mailing_lists: None,
            refresh_interval_secs: default_project_refresh(),
            extra: default_extra_projects(),
            base_domains: default_base_domains(),
            userid_registry: None,
        }
    }
}

/// One downstream account system. Either a preset, a full definition, or
/// a preset with overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub table_prefix: Option<String>,
    #[serde(default)]
    pub system_noun: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub create_args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub outcomes: Option<OutcomeRules>,
    #[serde(default)]
    pub template_vars: BTreeMap<String, String>,
}

impl AccountConfig {
    pub fn to_kind(&self) -> Result<RequestKind, ConfigError> {
        let mut kind = match self.preset.as_deref() {
            Some("confluence") => RequestKind::confluence(),
            Some("jira") => RequestKind::jira(),
            Some(other) => return Err(ConfigError::invalid(format!("unknown account preset '{}'", other))),
            None => {
                let name = self
                    .name
                    .clone()
                    .ok_or_else(|| ConfigError::invalid("account without preset needs a name"))?;
                let create_args = self.create_args.clone().ok_or_else(|| {
                    ConfigError::invalid(format!("account '{}' needs create_args", name))
                })?;
                RequestKind {
                    display_name: name.clone(),
                    table_prefix: name.clone(),
                    create_args,
                    ..Self::blank_kind(&name)
                }
            }
        };

        if let Some(name) = &self.name {
            kind.name = name.clone();
        }
        if let Some(display) = &self.display_name {
            kind.display_name = display.clone();
        }
        if let Some(prefix) = &self.table_prefix {
            kind.table_prefix = prefix.clone();
        }
        if let Some(noun) = &self.system_noun {
            kind.system_noun = noun.clone();
        }
        if let Some(program) = &self.program {
            kind.program = program.clone();
        }
        if let Some(args) = &self.create_args {
            kind.create_args = args.clone();
        }
        if let Some(timeout) = self.timeout_secs {
            kind.timeout_secs = timeout;
        }
        if let Some(outcomes) = &self.outcomes {
            kind.outcomes = outcomes.clone();
        }
        kind.template_vars.extend(self.template_vars.clone());

        if !is_route_safe(&kind.name) {
            return Err(ConfigError::invalid(format!(
                "account name '{}' must be lowercase letters, digits or '-'",
                kind.name
            )));
        }
        Ok(kind)
    }

    fn blank_kind(name: &str) -> RequestKind {
        let mut kind = RequestKind::confluence();
        kind.name = name.to_string();
        kind.system_noun = "account".to_string();
        kind.outcomes = OutcomeRules::default();
        kind.template_vars.clear();
        kind
    }
}

fn is_route_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactivationConfig {
    /// JSON object of username to registered email (file or URL)
    pub directory: String,
    #[serde(default = "default_directory_refresh")]
    pub refresh_interval_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_form_size() -> u64 {
    100 * 1024 * 1024
}

fn default_notification_target() -> String {
    selfserve_engine::DEFAULT_NOTIFICATION_TARGET.to_string()
}

fn default_mail_domain() -> String {
    "apache.org".to_string()
}

fn default_project_refresh() -> u64 {
    600
}

fn default_directory_refresh() -> u64 {
    86_400
}

fn default_extra_projects() -> Vec<String> {
    vec!["infra".to_string()]
}

// ============================================================================
// Sizes
// ============================================================================

/// `1024`, `64kb`, `10mb`, `1gb`.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = if let Some(n) = value.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = value.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else {
        (value.as_str(), 1)
    };
    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("Invalid size: '{}'", value))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Size too large: '{}'", value))
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

// ============================================================================
// Loading
// ============================================================================

impl PortalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PortalConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_form_size < MIN_FORM_SIZE {
            return Err(ConfigError::invalid("max_form_size needs to be at least 1kb"));
        }
        let kinds = self.kinds()?;
        let mut names = std::collections::BTreeSet::new();
        for kind in &kinds {
            if !names.insert(kind.name.clone()) {
                return Err(ConfigError::invalid(format!("account '{}' defined twice", kind.name)));
            }
        }
        for name in self.reactivation.keys() {
            if !names.contains(name) {
                return Err(ConfigError::invalid(format!(
                    "reactivation configured for unknown account '{}'",
                    name
                )));
            }
        }
        let slack_token_parts = (self.messaging.slack_token.is_some(), self.messaging.slack_channel.is_some());
        if slack_token_parts.0 != slack_token_parts.1 {
            return Err(ConfigError::invalid("slack_token and slack_channel go together"));
        }
        Ok(())
    }

    /// Configured account systems, resolved.
    pub fn kinds(&self) -> Result<Vec<RequestKind>, ConfigError> {
        self.accounts.iter().map(AccountConfig::to_kind).collect()
    }

    /// Create storage directories (mode 0700) that do not exist yet.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![self.storage.db_dir.as_path(), self.storage.queue_dir.as_path()];
        if let Some(audit) = &self.storage.audit_dir {
            dirs.push(audit.as_path());
        }
        for dir in dirs {
            if dir.is_dir() {
                continue;
            }
            info!(path = %dir.display(), "Creating missing directory");
            create_private_dir(dir).map_err(|source| ConfigError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
        [server]
        public_host = "selfserve.example.org"

        [storage]
        db_dir = "/tmp/db"
        queue_dir = "/tmp/queue"

        [messaging]
        sender = "Selfserve <selfserve@example.org>"
        template_dir = "templates"
    "#;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("2048").unwrap(), 2048);
        assert_eq!(parse_size("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("1.5mb").is_err());
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: PortalConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.error_reporting, ErrorReporting::Show);
        assert_eq!(config.server.max_form_size, 100 * 1024 * 1024);
        assert_eq!(config.server.rate_limit_per_ip, 0);
        assert!(config.server.trusted_proxies.is_empty());
        assert_eq!(config.messaging.notification_target, "notifications@infra.apache.org");
        assert_eq!(config.projects.extra, vec!["infra".to_string()]);
        assert_eq!(config.reaper, ReaperSettings::default());
        assert_eq!(config.resources, ResourceSettings::default());
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn presets_and_overrides() {
        let text = format!(
            r#"{MINIMAL}
            [[accounts]]
            preset = "confluence"
            timeout_secs = 30

            [[accounts]]
            preset = "jira"
            program = "/usr/local/bin/acli"

            [reactivation.jira]
            directory = "/srv/jira-users.json"
            "#
        );
        let config: PortalConfig = toml::from_str(&text).unwrap();
        config.validate().unwrap();
        let kinds = config.kinds().unwrap();
        assert_eq!(kinds[0].name, "confluence");
        assert_eq!(kinds[0].table_prefix, "cwiki");
        assert_eq!(kinds[0].timeout_secs, 30);
        assert_eq!(kinds[1].program, "/usr/local/bin/acli");
        assert_eq!(config.reactivation["jira"].refresh_interval_secs, 86_400);
    }

    #[test]
    fn rejects_bad_definitions() {
        let text = format!("{MINIMAL}\n[[accounts]]\npreset = \"gitlab\"\n");
        let config: PortalConfig = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());

        let text = format!("{MINIMAL}\n[[accounts]]\npreset = \"jira\"\n[[accounts]]\npreset = \"jira\"\n");
        let config: PortalConfig = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());

        let text = format!("{MINIMAL}\n[reactivation.confluence]\ndirectory = \"x.json\"\n");
        let config: PortalConfig = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());

        let text = MINIMAL.replace("[server]", "[server]\nmax_form_size = \"512\"");
        let config: PortalConfig = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_account_without_preset() {
        let text = format!(
            r#"{MINIMAL}
            [[accounts]]
            name = "wiki2"
            display_name = "Wiki Two"
            create_args = ["wiki2", "add", "{{userid}}"]
            "#
        );
        let config: PortalConfig = toml::from_str(&text).unwrap();
        let kind = config.kinds().unwrap().remove(0);
        assert_eq!(kind.name, "wiki2");
        assert_eq!(kind.table_prefix, "wiki2");
        assert_eq!(kind.display_name, "Wiki Two");
        assert!(kind.outcomes.conflicts.is_empty());
        assert_eq!(kind.create_argv("bob", "Bob", "b@example.org").last().unwrap(), "bob");
    }

    #[cfg(unix)]
    #[test]
    fn missing_dirs_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let mut config: PortalConfig = toml::from_str(MINIMAL).unwrap();
        config.storage.db_dir = tmp.path().join("db");
        config.storage.queue_dir = tmp.path().join("queue");
        config.ensure_dirs().unwrap();
        let mode = std::fs::metadata(&config.storage.db_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(config.storage.queue_dir.is_dir());
    }
}
