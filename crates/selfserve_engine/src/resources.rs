//! Space and project administration in the account systems.
//!
//! These requests have no pending state. An authorised caller's request
//! runs straight through a fixed sequence of admin tool calls and stops at
//! the first step that fails; every step carries its own failure message.

use crate::actor::Actor;
use crate::error::{RequestError, Result};
use crate::executor::{Classifier, Outcome, SideEffectExecutor};
use crate::kind::{default_program, default_timeout_secs};
use crate::lifecycle::Reply;
use crate::notify::{Notification, Notifier, Variables};
use crate::projects::ProjectRegistry;
use crate::validate::field_str;
use crate::Fields;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Confluence space keys and Jira project keys.
pub const RESOURCE_KEY_PATTERN: &str = r"^[A-Z0-9]+$";

const CONFLUENCE_FAILED: &str = "Confluence action failed due to an internal server error.";
const STEP_TIMED_OUT: &str =
    "The administration tool did not respond in time. Please try again later.";
const MSG_NOT_AN_OFFICER: &str = "Only officers or foundation members can use this feature";

fn default_protected_spaces() -> Vec<String> {
    ["INFRA", "INCUBATOR", "COMDEV"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_scheme_files() -> BTreeMap<String, PathBuf> {
    BTreeMap::from([(
        "workflow".to_string(),
        PathBuf::from("/x1/acli/site/js/jiraworkflowschemes.json"),
    )])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub program: String,
    /// Spaces that can never be archived
    pub protected_spaces: Vec<String>,
    /// Scheme listings offered to Jira project requesters, by scheme type
    pub jira_scheme_files: BTreeMap<String, PathBuf>,
    pub timeout_secs: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            protected_spaces: default_protected_spaces(),
            jira_scheme_files: default_scheme_files(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PermissionEntry {
    id: String,
    #[serde(rename = "idType")]
    id_type: String,
}

pub struct ResourceService {
    settings: ResourceSettings,
    executor: SideEffectExecutor,
    projects: Arc<ProjectRegistry>,
    notifier: Arc<dyn Notifier>,
    key: Regex,
    infra_list: String,
    mail_domain: String,
}

impl ResourceService {
    pub fn new(
        settings: ResourceSettings,
        executor: SideEffectExecutor,
        projects: Arc<ProjectRegistry>,
        notifier: Arc<dyn Notifier>,
        mail_domain: impl Into<String>,
    ) -> std::result::Result<Self, regex::Error> {
        let infra_list = projects.private_list("infra");
        Ok(Self {
            settings,
            executor,
            projects,
            notifier,
            key: Regex::new(RESOURCE_KEY_PATTERN)?,
            infra_list,
            mail_domain: mail_domain.into(),
        })
    }

    // ========================================================================
    // Confluence spaces
    // ========================================================================

    /// Create a blank space with the default permission set.
    pub async fn create_space(&self, actor: &Actor, fields: &Fields) -> Result<Reply> {
        if !(actor.is_member || actor.is_chair || actor.is_role_account) {
            return Err(RequestError::unauthorized(MSG_NOT_AN_OFFICER));
        }
        let space = field_str(fields, "space").unwrap_or_default();
        if !self.key.is_match(space) {
            return Err(RequestError::validation("Invalid space name specified"));
        }
        let admin = required(
            fields,
            "admin",
            "Please specify a user to set as initial administrator of the new space",
        )?;
        let description = required(
            fields,
            "description",
            "Please write a short description of this new space",
        )?;

        self.lookup_user(
            "confluence",
            admin,
            "Could not find the specified administrator ID in confluence",
        )
        .await?;
        self.step(
            self.argv(&[
                "confluence",
                "-v",
                "--action",
                "addSpace",
                "--space",
                space,
                "--description",
                description,
            ]),
            "Could not create new space, it may already exist",
        )
        .await?;

        let access = [
            self.permission("addPermissions", "@all", space, "--userId", admin),
            self.permission("addPermissions", "VIEWSPACE", space, "--userId", "Anonymous"),
            self.permission(
                "addPermissions",
                "VIEWSPACE,EXPORTSPACE",
                space,
                "--group",
                "confluence-users",
            ),
            self.permission("removePermissions", "@all", space, "--userId", "infrabot"),
        ];
        for argv in access {
            if let Err(e) = self.step(argv, CONFLUENCE_FAILED).await {
                warn!(space, "Space created but its default permissions are incomplete");
                return Err(e);
            }
        }
        info!(space, admin, actor = %actor.uid, "Confluence space created");

        let requester = actor.address(&self.mail_domain);
        self.announce(
            format!(
                "A new confluence space, `{}`, has been created as requested by {}.",
                space, requester
            ),
            Notification::new(
                "confluence_created.txt",
                vec![self.infra_list.clone(), requester],
                vars(&[("spacename", space), ("requester", actor.uid.as_str())]),
            ),
        )
        .await;
        Ok(Reply::ok("Confluence space created"))
    }

    /// Mark a space archived and leave it world-readable, writable by nobody.
    pub async fn archive_space(&self, actor: &Actor, fields: &Fields) -> Result<Reply> {
        if !(actor.is_member || actor.is_chair) {
            return Err(RequestError::unauthorized(MSG_NOT_AN_OFFICER));
        }
        let space = field_str(fields, "space").unwrap_or_default();
        if !self.key.is_match(space) {
            return Err(RequestError::validation("Invalid space name specified"));
        }
        if self.settings.protected_spaces.iter().any(|p| p == space) {
            return Err(RequestError::validation("You cannot archive this confluence space"));
        }

        let (users, groups) = self.space_owners(space).await?;
        self.step(
            self.argv(&[
                "confluence",
                "-v",
                "--action",
                "updateSpace",
                "--options",
                "status=archived",
                "--space",
                space,
            ]),
            CONFLUENCE_FAILED,
        )
        .await?;
        if !users.is_empty() {
            let users = users.into_iter().collect::<Vec<_>>().join(",");
            self.step(
                self.permission("removePermissions", "@all", space, "--userId", &users),
                CONFLUENCE_FAILED,
            )
            .await?;
        }
        if !groups.is_empty() {
            let groups = groups.into_iter().collect::<Vec<_>>().join(",");
            self.step(
                self.permission("removePermissions", "@all", space, "--group", &groups),
                CONFLUENCE_FAILED,
            )
            .await?;
        }
        self.step(
            self.permission("addPermissions", "VIEWSPACE", space, "--userId", "Anonymous"),
            CONFLUENCE_FAILED,
        )
        .await?;
        self.step(
            self.permission(
                "addPermissions",
                "VIEWSPACE,EXPORTSPACE",
                space,
                "--group",
                "confluence-users",
            ),
            CONFLUENCE_FAILED,
        )
        .await?;
        info!(space, actor = %actor.uid, "Confluence space archived");

        let requester = actor.address(&self.mail_domain);
        self.announce(
            format!(
                "The confluence space, `{}`, has been archived as read-only, as requested by {}.",
                space, requester
            ),
            Notification::new(
                "confluence_archived.txt",
                vec![self.infra_list.clone(), requester],
                vars(&[("spacename", space), ("requester", actor.uid.as_str())]),
            ),
        )
        .await;
        Ok(Reply::ok("Confluence space archived"))
    }

    /// Users and groups holding any permission on `space`.
    async fn space_owners(&self, space: &str) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let argv = self.argv(&[
            "confluence",
            "--action",
            "getSpacePermissionList",
            "--outputType",
            "json",
            "--space",
            space,
            "--quiet",
        ]);
        let classifier = Classifier::plain(CONFLUENCE_FAILED, STEP_TIMED_OUT);
        let (outcome, output) = self.executor.execute_with_output(&argv, &classifier).await;
        let (outcome, stdout) = match (outcome, output) {
            (Outcome::TimedOut(msg), _) => return Err(RequestError::downstream(msg)),
            (outcome, Some(output)) => (outcome, output.stdout),
            (_, None) => return Err(RequestError::downstream(CONFLUENCE_FAILED)),
        };
        if stdout.trim().is_empty() {
            return Err(RequestError::not_found("Could not find this confluence space"));
        }
        if let Some(msg) = outcome.failure_message() {
            return Err(RequestError::downstream(msg));
        }

        let entries: Vec<PermissionEntry> = serde_json::from_str(&stdout).map_err(|e| {
            warn!(space, error = %e, "Unreadable space permission list");
            RequestError::downstream(CONFLUENCE_FAILED)
        })?;
        let mut users = BTreeSet::new();
        let mut groups = BTreeSet::new();
        for entry in entries {
            match entry.id_type.as_str() {
                "user" => {
                    users.insert(entry.id);
                }
                "group" => {
                    groups.insert(entry.id);
                }
                _ => {}
            }
        }
        Ok((users, groups))
    }

    // ========================================================================
    // Jira projects
    // ========================================================================

    /// Create a project owned by an existing PMC: the PMC group administers
    /// it, the committer group can work in it.
    pub async fn create_jira_project(&self, actor: &Actor, fields: &Fields) -> Result<Reply> {
        if !actor.is_pmc_member() {
            return Err(RequestError::unauthorized(
                "Only members of a (P)PMC may create jira projects",
            ));
        }
        let key = field_str(fields, "project_key").unwrap_or_default();
        if !self.key.is_match(key) {
            return Err(RequestError::validation("Invalid project key specified"));
        }
        let name = required(
            fields,
            "project_name",
            "Please specify a title for the new Jira project",
        )?;
        let description = required(
            fields,
            "description",
            "Please write a short description of this new project",
        )?;
        let lead = required(
            fields,
            "project_lead",
            "Please specify a project lead for this project",
        )?;
        let owner = field_str(fields, "ldap_project").unwrap_or_default();
        if !self.projects.is_known_project(owner) {
            return Err(RequestError::validation(
                "Please specify a valid, current apache project to assign this Jira project to",
            ));
        }
        if !actor.is_root && !actor.on_pmc(owner) {
            return Err(RequestError::unauthorized(
                "You can only create a Jira project for an Apache project you are on the PMC of",
            ));
        }
        let issue_scheme = required(
            fields,
            "issue_scheme",
            "Please specify a valid issue scheme for this project",
        )?;
        let workflow_scheme = required(
            fields,
            "workflow_scheme",
            "Please specify a valid workflow scheme for this project",
        )?;
        let homepage = required(
            fields,
            "homepage_url",
            "Please specify a homepage URL for this project",
        )?;

        self.lookup_user(
            "jira",
            lead,
            "Could not find the specified project lead ID in Jira",
        )
        .await?;
        self.step(
            self.argv(&[
                "jira",
                "-v",
                "--action",
                "createProject",
                "--project",
                key,
                "--name",
                name,
                "--description",
                description,
                "--lead",
                lead,
                "--issueTypeScheme",
                issue_scheme,
                "--workflowScheme",
                workflow_scheme,
                "--url",
                homepage,
                "--notificationScheme",
                "Empty Scheme",
                "--permissionScheme",
                "_Default Permission Scheme_",
            ]),
            "Could not create new jira project, it may already exist",
        )
        .await?;

        let pmc_group = format!("{}-pmc", owner);
        self.step(
            self.role_actors(key, "administrators", &pmc_group),
            &format!("Could not assign administrator access to {}", pmc_group),
        )
        .await?;
        self.step(
            self.role_actors(key, "committers", owner),
            &format!("Could not assign write access to {} committers", owner),
        )
        .await?;
        info!(project_key = key, owner, actor = %actor.uid, "Jira project created");

        let requester = actor.address(&self.mail_domain);
        self.announce(
            format!(
                "A new Jira project, `{}`, has been created as requested by {}.",
                key, requester
            ),
            Notification::new(
                "jira_project_created.txt",
                vec![
                    self.infra_list.clone(),
                    self.projects.private_list(owner),
                    requester,
                ],
                vars(&[
                    ("project_key", key),
                    ("ldap_project", owner),
                    ("requester", actor.uid.as_str()),
                ]),
            ),
        )
        .await;
        Ok(Reply::ok("Jira project created"))
    }

    /// Scheme listings by type. Missing files are left out, unreadable
    /// JSON shows up as an empty object.
    pub async fn jira_schemes(&self) -> Value {
        let mut schemes = serde_json::Map::new();
        for (kind, path) in &self.settings.jira_scheme_files {
            let text = match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read scheme listing");
                    continue;
                }
            };
            let listing = serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Scheme listing is not valid JSON");
                Value::Object(serde_json::Map::new())
            });
            schemes.insert(kind.clone(), listing);
        }
        Value::Object(schemes)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    fn argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.settings.program.clone())
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }

    fn permission(
        &self,
        action: &str,
        permissions: &str,
        space: &str,
        target_flag: &str,
        target: &str,
    ) -> Vec<String> {
        self.argv(&[
            "confluence",
            "--action",
            action,
            "--permissions",
            permissions,
            "--space",
            space,
            target_flag,
            target,
        ])
    }

    fn role_actors(&self, key: &str, role: &str, group: &str) -> Vec<String> {
        self.argv(&[
            "jira",
            "--action",
            "addProjectRoleActors",
            "--project",
            key,
            "--role",
            role,
            "--group",
            group,
        ])
    }

    async fn step(&self, argv: Vec<String>, failure: &str) -> Result<()> {
        let classifier = Classifier::plain(failure, STEP_TIMED_OUT);
        match self.executor.execute(&argv, &classifier).await.failure_message() {
            None => Ok(()),
            Some(msg) => Err(RequestError::downstream(msg)),
        }
    }

    /// An unknown user is the caller's mistake, not a backend fault.
    async fn lookup_user(&self, system: &str, user: &str, missing: &str) -> Result<()> {
        let argv = self.argv(&[system, "--action", "getUser", "--userId", user, "--quiet"]);
        let classifier = Classifier::plain(missing, STEP_TIMED_OUT);
        match self.executor.execute(&argv, &classifier).await {
            Outcome::Success | Outcome::SoftSuccess => Ok(()),
            Outcome::TimedOut(msg) => Err(RequestError::downstream(msg)),
            Outcome::Conflict(msg) | Outcome::Failed(msg) => Err(RequestError::validation(msg)),
        }
    }

    async fn announce(&self, chat: String, mail: Notification) {
        if let Err(e) = self.notifier.post_chat(&chat).await {
            warn!(error = %e, "Chat notification failed");
        }
        if let Err(e) = self.notifier.send(&mail).await {
            warn!(template = %mail.template, error = %e, "Notification failed");
        }
    }
}

fn required<'a>(fields: &'a Fields, name: &str, missing: &str) -> Result<&'a str> {
    field_str(fields, name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RequestError::validation(missing))
}

fn vars(pairs: &[(&str, &str)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, CommandRunner, ExecError};
    use crate::projects::{default_base_domains, CommitteeInfo, ProjectSnapshot};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Succeeds unless the action is `failing`; prints `stdout[action]`.
    #[derive(Default)]
    struct Acli {
        calls: Mutex<Vec<Vec<String>>>,
        failing: Option<&'static str>,
        stdout: BTreeMap<&'static str, String>,
    }

    impl Acli {
        fn actions(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|argv| action(argv)).collect()
        }

        fn call(&self, n: usize) -> Vec<String> {
            self.calls.lock().unwrap()[n].clone()
        }
    }

    fn action(argv: &[String]) -> String {
        argv.iter()
            .skip_while(|a| a.as_str() != "--action")
            .nth(1)
            .cloned()
            .unwrap_or_default()
    }

    #[async_trait]
    impl CommandRunner for Acli {
        async fn run(&self, argv: &[String], _timeout: Duration) -> std::result::Result<CommandOutput, ExecError> {
            self.calls.lock().unwrap().push(argv.to_vec());
            let action = action(argv);
            let stdout = self.stdout.get(action.as_str()).cloned().unwrap_or_default();
            if self.failing == Some(action.as_str()) {
                Ok(CommandOutput::failure(1, stdout, "Remote error"))
            } else {
                Ok(CommandOutput::success(stdout))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        mails: Mutex<Vec<Notification>>,
        chats: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, notification: &Notification) -> AnyResult<()> {
            self.mails.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn post_chat(&self, text: &str) -> AnyResult<()> {
            self.chats.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        service: ResourceService,
        acli: Arc<Acli>,
        recorder: Arc<Recorder>,
    }

    fn fixture_with(acli: Acli, settings: ResourceSettings) -> Fixture {
        let acli = Arc::new(acli);
        let recorder = Arc::new(Recorder::default());
        let runner: Arc<dyn CommandRunner> = acli.clone();
        let snapshot = ProjectSnapshot::build(
            &CommitteeInfo::default(),
            &["httpd".to_string(), "infra".to_string(), "kafka".to_string()],
            &default_base_domains(),
            "apache.org",
        );
        let service = ResourceService::new(
            settings,
            SideEffectExecutor::new(runner, None, Duration::from_secs(5)),
            Arc::new(ProjectRegistry::new(snapshot, "apache.org")),
            recorder.clone(),
            "apache.org",
        )
        .unwrap();
        Fixture {
            service,
            acli,
            recorder,
        }
    }

    fn fixture(acli: Acli) -> Fixture {
        fixture_with(acli, ResourceSettings::default())
    }

    fn form(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn member() -> Actor {
        let mut actor = Actor::new("alice");
        actor.is_member = true;
        actor
    }

    fn pmc_member() -> Actor {
        let mut actor = Actor::new("carol");
        actor.pmcs = vec!["httpd".to_string()];
        actor
    }

    fn message(result: Result<Reply>) -> String {
        match result {
            Err(e) => e.to_string(),
            Ok(reply) => panic!("expected failure, got {:?}", reply),
        }
    }

    fn new_space() -> Value {
        json!({ "space": "HTTPD", "admin": "bob", "description": "Apache HTTP Server wiki" })
    }

    fn new_project() -> Value {
        json!({
            "project_key": "HTTPD",
            "project_name": "Apache HTTP Server",
            "description": "Issues for httpd",
            "project_lead": "carol",
            "ldap_project": "httpd",
            "issue_scheme": "Default Issue Type Scheme",
            "workflow_scheme": "Default Workflow Scheme",
            "homepage_url": "https://httpd.apache.org/"
        })
    }

    #[tokio::test]
    async fn space_creation_runs_full_sequence() {
        let f = fixture(Acli::default());
        let reply = f.service.create_space(&member(), &form(new_space())).await.unwrap();
        assert_eq!(reply.message, "Confluence space created");

        assert_eq!(
            f.acli.actions(),
            vec![
                "getUser",
                "addSpace",
                "addPermissions",
                "addPermissions",
                "addPermissions",
                "removePermissions"
            ]
        );
        assert_eq!(f.acli.call(0)[0], crate::kind::DEFAULT_ACLI);
        assert!(f.acli.call(2).ends_with(&["--userId".to_string(), "bob".to_string()]));
        assert!(f.acli.call(5).ends_with(&["--userId".to_string(), "infrabot".to_string()]));

        let mails = f.recorder.mails.lock().unwrap();
        assert_eq!(mails[0].template, "confluence_created.txt");
        assert_eq!(
            mails[0].recipients,
            vec!["private@infra.apache.org".to_string(), "alice@apache.org".to_string()]
        );
        assert!(f.recorder.chats.lock().unwrap()[0].contains("`HTTPD`"));
    }

    #[tokio::test]
    async fn space_creation_is_gated_and_validated() {
        let f = fixture(Acli::default());

        let committer = Actor::new("dave");
        assert!(matches!(
            f.service.create_space(&committer, &form(new_space())).await,
            Err(RequestError::Unauthorized(_))
        ));

        let mut chair = Actor::new("erin");
        chair.is_chair = true;
        let mut v = new_space();
        v["space"] = json!("httpd-wiki");
        assert_eq!(
            message(f.service.create_space(&chair, &form(v)).await),
            "Invalid space name specified"
        );

        let mut v = new_space();
        v["admin"] = json!("  ");
        assert!(message(f.service.create_space(&member(), &form(v)).await)
            .starts_with("Please specify a user"));

        assert!(f.acli.actions().is_empty());
    }

    #[tokio::test]
    async fn unknown_admin_stops_before_space_creation() {
        let f = fixture(Acli {
            failing: Some("getUser"),
            ..Default::default()
        });
        let result = f.service.create_space(&member(), &form(new_space())).await;
        match result {
            Err(RequestError::Validation(msg)) => {
                assert_eq!(msg, "Could not find the specified administrator ID in confluence")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.acli.actions(), vec!["getUser"]);
        assert!(f.recorder.mails.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permission_failure_after_creation_is_downstream() {
        let f = fixture(Acli {
            failing: Some("removePermissions"),
            ..Default::default()
        });
        let result = f.service.create_space(&member(), &form(new_space())).await;
        assert!(matches!(result, Err(RequestError::Downstream(ref m)) if m == CONFLUENCE_FAILED));
        assert!(f.recorder.chats.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn protected_spaces_cannot_be_archived() {
        let f = fixture(Acli::default());
        assert_eq!(
            message(f.service.archive_space(&member(), &form(json!({ "space": "INFRA" }))).await),
            "You cannot archive this confluence space"
        );

        let mut role = Actor::new("svc");
        role.is_role_account = true;
        assert!(matches!(
            f.service.archive_space(&role, &form(json!({ "space": "OLDWIKI" }))).await,
            Err(RequestError::Unauthorized(_))
        ));
        assert!(f.acli.actions().is_empty());
    }

    #[tokio::test]
    async fn archive_strips_owners_and_leaves_read_access() {
        let listing = json!([
            { "id": "bob", "idType": "user" },
            { "id": "alice", "idType": "user" },
            { "id": "oldwiki-editors", "idType": "group" },
            { "id": "", "idType": "anonymous" }
        ]);
        let f = fixture(Acli {
            stdout: BTreeMap::from([("getSpacePermissionList", listing.to_string())]),
            ..Default::default()
        });

        let reply = f
            .service
            .archive_space(&member(), &form(json!({ "space": "OLDWIKI" })))
            .await
            .unwrap();
        assert_eq!(reply.message, "Confluence space archived");

        assert_eq!(
            f.acli.actions(),
            vec![
                "getSpacePermissionList",
                "updateSpace",
                "removePermissions",
                "removePermissions",
                "addPermissions",
                "addPermissions"
            ]
        );
        assert!(f.acli.call(2).ends_with(&["--userId".to_string(), "alice,bob".to_string()]));
        assert!(f.acli.call(3).ends_with(&["--group".to_string(), "oldwiki-editors".to_string()]));
        assert!(f.acli.call(4).ends_with(&["--userId".to_string(), "Anonymous".to_string()]));
        assert_eq!(
            f.recorder.mails.lock().unwrap()[0].template,
            "confluence_archived.txt"
        );
    }

    #[tokio::test]
    async fn archiving_a_missing_space_is_not_found() {
        let f = fixture(Acli {
            failing: Some("getSpacePermissionList"),
            ..Default::default()
        });
        let result = f
            .service
            .archive_space(&member(), &form(json!({ "space": "NOPE" })))
            .await;
        assert!(matches!(result, Err(RequestError::NotFound(_))));
        assert_eq!(f.acli.actions(), vec!["getSpacePermissionList"]);
    }

    #[tokio::test]
    async fn jira_project_goes_to_the_owning_pmc() {
        let f = fixture(Acli::default());
        let reply = f
            .service
            .create_jira_project(&pmc_member(), &form(new_project()))
            .await
            .unwrap();
        assert_eq!(reply.message, "Jira project created");

        assert_eq!(
            f.acli.actions(),
            vec!["getUser", "createProject", "addProjectRoleActors", "addProjectRoleActors"]
        );
        let create = f.acli.call(1);
        assert!(create.contains(&"Apache HTTP Server".to_string()));
        assert!(create.contains(&"_Default Permission Scheme_".to_string()));
        assert!(f.acli.call(2).ends_with(&["--group".to_string(), "httpd-pmc".to_string()]));
        assert!(f.acli.call(3).ends_with(&["--group".to_string(), "httpd".to_string()]));

        let mails = f.recorder.mails.lock().unwrap();
        assert_eq!(
            mails[0].recipients,
            vec![
                "private@infra.apache.org".to_string(),
                "private@httpd.apache.org".to_string(),
                "carol@apache.org".to_string()
            ]
        );
        assert_eq!(mails[0].variables["ldap_project"], "httpd");
    }

    #[tokio::test]
    async fn jira_project_rules() {
        let f = fixture(Acli::default());

        assert!(matches!(
            f.service
                .create_jira_project(&Actor::new("dave"), &form(new_project()))
                .await,
            Err(RequestError::Unauthorized(_))
        ));

        let mut v = new_project();
        v["project_key"] = json!("httpd");
        assert_eq!(
            message(f.service.create_jira_project(&pmc_member(), &form(v)).await),
            "Invalid project key specified"
        );

        let mut v = new_project();
        v["ldap_project"] = json!("nosuchproject");
        assert!(message(f.service.create_jira_project(&pmc_member(), &form(v)).await)
            .starts_with("Please specify a valid, current apache project"));

        let mut v = new_project();
        v["ldap_project"] = json!("kafka");
        assert!(matches!(
            f.service.create_jira_project(&pmc_member(), &form(v.clone())).await,
            Err(RequestError::Unauthorized(_))
        ));

        let mut v2 = new_project();
        v2.as_object_mut().unwrap().remove("homepage_url");
        assert_eq!(
            message(f.service.create_jira_project(&pmc_member(), &form(v2)).await),
            "Please specify a homepage URL for this project"
        );
        assert!(f.acli.actions().is_empty());

        let mut root = Actor::new("root");
        root.is_root = true;
        assert!(f.service.create_jira_project(&root, &form(v)).await.is_ok());
    }

    #[tokio::test]
    async fn role_assignment_failure_names_the_group() {
        let f = fixture(Acli {
            failing: Some("addProjectRoleActors"),
            ..Default::default()
        });
        let result = f
            .service
            .create_jira_project(&pmc_member(), &form(new_project()))
            .await;
        assert_eq!(message(result), "Could not assign administrator access to httpd-pmc");
    }

    #[tokio::test]
    async fn scheme_listings() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("workflow.json"), r#"[{"name":"Default"}]"#).unwrap();
        std::fs::write(tmp.path().join("issue.json"), "not json").unwrap();
        let settings = ResourceSettings {
            jira_scheme_files: BTreeMap::from([
                ("workflow".to_string(), tmp.path().join("workflow.json")),
                ("issue".to_string(), tmp.path().join("issue.json")),
                ("screen".to_string(), tmp.path().join("missing.json")),
            ]),
            ..Default::default()
        };
        let f = fixture_with(Acli::default(), settings);
        assert_eq!(
            f.service.jira_schemes().await,
            json!({ "workflow": [{ "name": "Default" }], "issue": {} })
        );
    }
}
