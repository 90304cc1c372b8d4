//! Mailing-list creation requests.
//!
//! Nothing is created here. A validated request becomes a job file in the
//! [`JobQueue`]; the list server's worker picks it up from there.

use crate::actor::Actor;
use crate::error::{RequestError, Result};
use crate::lifecycle::Reply;
use crate::notify::{Notification, Notifier, Variables};
use crate::projects::ProjectRegistry;
use crate::queue::{JobQueue, QueueError};
use crate::validate::{field_str, Validator};
use crate::Fields;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const LISTPART_PATTERN: &str = r"^[a-z0-9]+(?:-[a-z0-9]+)*$";

/// Lists that may, and must, be private.
const PRIVATE_LISTS: [&str; 2] = ["private", "security"];
const MODERATION_OPTIONS: [&str; 3] = ["mu", "Mu", "mU"];
const ROOT_MODERATION_OPTIONS: [&str; 4] = ["mu", "mU", "Mu", "MU"];
const RESERVED_ENDINGS: [&str; 3] = ["-digest", "-default", "-owner"];

const EXPEDITE_BACKDATE_SECS: i64 = 24 * 60 * 60;

const MSG_QUEUED: &str =
    "Request logged. Please allow for up to 24 hours for the request to be processed.";

/// Job file handed to the list server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailingListJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub id: String,
    pub requester: String,
    pub requested: i64,
    pub domain: String,
    pub list: String,
    pub muopts: String,
    pub private: bool,
    pub mods: Vec<String>,
    /// `t` adds the list trailer, `T` omits it
    pub trailer: String,
    pub expedited: bool,
}

impl MailingListJob {
    pub fn job_id(listpart: &str, domainpart: &str) -> String {
        format!("mailinglist-{}-{}.json", listpart, domainpart)
    }
}

pub struct MailingListService {
    projects: Arc<ProjectRegistry>,
    queue: JobQueue,
    notifier: Arc<dyn Notifier>,
    validator: Validator,
    listpart: Regex,
    /// Infrastructure's private list, copied on every request
    infra_list: String,
    /// Domain of requester addresses
    mail_domain: String,
}

impl MailingListService {
    pub fn new(
        projects: Arc<ProjectRegistry>,
        queue: JobQueue,
        notifier: Arc<dyn Notifier>,
        mail_domain: impl Into<String>,
    ) -> std::result::Result<Self, regex::Error> {
        let infra_list = projects.private_list("infra");
        Ok(Self {
            projects,
            queue,
            notifier,
            validator: Validator::new()?,
            listpart: Regex::new(LISTPART_PATTERN)?,
            infra_list,
            mail_domain: mail_domain.into(),
        })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Root manages every domain; PMC members manage their projects' domains.
    pub fn can_manage_domain(&self, actor: &Actor, domain: &str) -> bool {
        actor.is_root
            || actor
                .pmcs
                .iter()
                .any(|p| self.projects.mail_domain(p).as_deref() == Some(domain))
    }

    /// Checks in order; the first failure is reported.
    pub fn check(&self, actor: &Actor, fields: &Fields, now: i64) -> Result<MailingListJob> {
        let fail = |msg: &str| Err(RequestError::validation(msg));

        let listpart = field_str(fields, "listpart").unwrap_or_default();
        let domainpart = field_str(fields, "domainpart").unwrap_or_default();
        let is_private = flag(fields, "private");
        let expedited = flag(fields, "expedited");
        let muopts = field_str(fields, "muopts").unwrap_or_default();

        if listpart.is_empty() || !self.listpart.is_match(listpart) {
            return fail(
                "Invalid list name. Must only consist of alphanumerical characters and dashes",
            );
        }
        if listpart.ends_with("-digest") {
            return fail("A mailing list cannot end in -digest");
        }
        if !self.projects.is_mail_domain(domainpart) {
            return fail("Mailing list domain is not a valid ASF hostname");
        }
        if !self.can_manage_domain(actor, domainpart) {
            return fail("You are not authorized to create mailing lists for this domain");
        }

        let moderators: Vec<String> = match fields.get("moderators").and_then(|v| v.as_array()) {
            Some(list) if !list.is_empty() => {
                let mut mods = Vec::with_capacity(list.len());
                for value in list {
                    match value.as_str() {
                        Some(m) if self.validator.is_valid_email(m) => mods.push(m.to_string()),
                        _ => {
                            return fail(
                                "Invalid moderator list provided. Please use valid email addresses only",
                            )
                        }
                    }
                }
                mods
            }
            _ => return fail("You need to provide a list of moderators"),
        };

        let reserved_private = PRIVATE_LISTS.contains(&listpart);
        if is_private && !reserved_private && !actor.is_root {
            return fail(
                "Only private@ or security@ can be made private by default. Please file a ticket \
                 with Infrastructure for non-standard private lists",
            );
        }
        if !is_private && reserved_private {
            return fail("private@ and security@ lists MUST be marked as private");
        }
        let muopts_ok = MODERATION_OPTIONS.contains(&muopts)
            || (actor.is_root && ROOT_MODERATION_OPTIONS.contains(&muopts));
        if !muopts_ok {
            return fail("Invalid moderation options given");
        }
        let trailer = match fields.get("trailer") {
            None => false,
            Some(v) => match v.as_bool() {
                Some(b) => b,
                None => return fail("Trailer option must be a boolean value"),
            },
        };
        if expedited && !actor.is_root {
            return fail("Only infrastructure can expedite mailing list requests");
        }
        if self.projects.list_exists(&format!("{}@{}", listpart, domainpart)) {
            return fail("This mailing list already exists");
        }
        if RESERVED_ENDINGS.iter().any(|ending| listpart.ends_with(ending)) {
            return fail("Invalid list name. Cannot end in a restricted ezmlm keyword");
        }

        let requested = if expedited {
            now - EXPEDITE_BACKDATE_SECS
        } else {
            now
        };
        Ok(MailingListJob {
            job_type: "mailinglist".to_string(),
            id: MailingListJob::job_id(listpart, domainpart),
            requester: actor.uid.clone(),
            requested,
            domain: domainpart.to_string(),
            list: listpart.to_string(),
            muopts: muopts.to_string(),
            private: is_private,
            mods: moderators,
            trailer: if trailer { "t" } else { "T" }.to_string(),
            expedited,
        })
    }

    /// Validate, queue and announce a new list.
    pub async fn request(&self, actor: &Actor, fields: &Fields, now: i64) -> Result<Reply> {
        if !actor.is_pmc_member() {
            return Err(RequestError::unauthorized(
                "Only PMC members can request new mailing lists",
            ));
        }
        let job = self.check(actor, fields, now)?;

        match self.queue.enqueue(&job.id, &job).await {
            Ok(_) => {}
            Err(QueueError::Exists(_)) => {
                return Err(RequestError::conflict(
                    "This mailing list has already been requested and is awaiting creation",
                ))
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            job_id = %job.id,
            actor = %actor.uid,
            private = job.private,
            "Mailing list queued"
        );

        let visibility = if job.private { "private" } else { "public" };
        let requester = actor.address(&self.mail_domain);
        let text = format!(
            "A new {} mailing list, `{}@{}` has been queued for creation, as requested by {}.",
            visibility, job.list, job.domain, requester
        );
        if let Err(e) = self.notifier.post_chat(&text).await {
            warn!(job_id = %job.id, error = %e, "Chat notification failed");
        }

        let mut vars = Variables::new();
        vars.insert("listpart".to_string(), job.list.clone());
        vars.insert("domainpart".to_string(), job.domain.clone());
        vars.insert("requester".to_string(), actor.uid.clone());
        let mail = Notification::new(
            "mailinglist_create.txt",
            vec![self.infra_list.clone(), requester],
            vars,
        );
        if let Err(e) = self.notifier.send(&mail).await {
            warn!(job_id = %job.id, error = %e, "Mailing list notification failed");
        }

        Ok(Reply::ok(MSG_QUEUED))
    }
}

/// Boolean form flag; JSON `true`, or a non-empty string other than
/// `false`/`0` from urlencoded forms.
fn flag(fields: &Fields, name: &str) -> bool {
    match fields.get(name) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::{default_base_domains, CommitteeInfo, ProjectSnapshot};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

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

    fn registry() -> Arc<ProjectRegistry> {
        let snapshot = ProjectSnapshot::build(
            &CommitteeInfo::default(),
            &["httpd".to_string(), "infra".to_string()],
            &default_base_domains(),
            "apache.org",
        );
        let registry = ProjectRegistry::new(snapshot, "apache.org");
        registry.replace_mailing_lists(["dev@httpd.apache.org".to_string()].into_iter().collect());
        Arc::new(registry)
    }

    fn pmc_actor() -> Actor {
        let mut actor = Actor::new("alice");
        actor.pmcs = vec!["httpd".to_string()];
        actor
    }

    fn form(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn good() -> serde_json::Value {
        json!({
            "listpart": "commits",
            "domainpart": "httpd.apache.org",
            "moderators": ["alice@apache.org"],
            "muopts": "mu",
            "trailer": true
        })
    }

    fn service(tmp: &TempDir, recorder: Arc<Recorder>) -> MailingListService {
        MailingListService::new(registry(), JobQueue::new(tmp.path()), recorder, "apache.org").unwrap()
    }

    fn rejection(service: &MailingListService, actor: &Actor, value: serde_json::Value) -> String {
        match service.check(actor, &form(value), 1000) {
            Err(RequestError::Validation(msg)) => msg,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn rules() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp, Arc::new(Recorder::default()));
        let actor = pmc_actor();

        let job = svc.check(&actor, &form(good()), 1000).unwrap();
        assert_eq!(job.id, "mailinglist-commits-httpd.apache.org.json");
        assert_eq!(job.trailer, "t");
        assert_eq!(job.requested, 1000);

        let mut v = good();
        v["listpart"] = json!("Bad_Name");
        assert!(rejection(&svc, &actor, v).starts_with("Invalid list name"));

        let mut v = good();
        v["listpart"] = json!("dev-digest");
        assert_eq!(rejection(&svc, &actor, v), "A mailing list cannot end in -digest");

        let mut v = good();
        v["domainpart"] = json!("infra.apache.org");
        assert_eq!(
            rejection(&svc, &actor, v),
            "You are not authorized to create mailing lists for this domain"
        );

        let mut v = good();
        v["moderators"] = json!([]);
        assert_eq!(rejection(&svc, &actor, v), "You need to provide a list of moderators");

        let mut v = good();
        v["listpart"] = json!("private");
        assert_eq!(
            rejection(&svc, &actor, v),
            "private@ and security@ lists MUST be marked as private"
        );

        let mut v = good();
        v["private"] = json!(true);
        assert!(rejection(&svc, &actor, v).starts_with("Only private@ or security@"));

        let mut v = good();
        v["muopts"] = json!("MU");
        assert_eq!(rejection(&svc, &actor, v), "Invalid moderation options given");

        let mut v = good();
        v["expedited"] = json!(true);
        assert_eq!(
            rejection(&svc, &actor, v),
            "Only infrastructure can expedite mailing list requests"
        );

        let mut v = good();
        v["listpart"] = json!("dev");
        assert_eq!(rejection(&svc, &actor, v), "This mailing list already exists");

        let mut v = good();
        v["listpart"] = json!("foo-owner");
        assert!(rejection(&svc, &actor, v).contains("restricted ezmlm keyword"));
    }

    #[test]
    fn root_privileges() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp, Arc::new(Recorder::default()));
        let mut root = Actor::new("infra-bot");
        root.is_root = true;

        let mut v = good();
        v["domainpart"] = json!("infra.apache.org");
        v["muopts"] = json!("MU");
        v["private"] = json!(true);
        v["expedited"] = json!(true);
        let job = svc.check(&root, &form(v), 100_000).unwrap();
        assert_eq!(job.requested, 100_000 - EXPEDITE_BACKDATE_SECS);
        assert!(job.private);
    }

    #[tokio::test]
    async fn request_queues_and_notifies() {
        let tmp = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let svc = service(&tmp, recorder.clone());

        let reply = svc.request(&pmc_actor(), &form(good()), 1000).await.unwrap();
        assert!(reply.success);

        let jobs = svc.queue().list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["list"], "commits");
        assert_eq!(jobs[0]["mods"], json!(["alice@apache.org"]));

        let mails = recorder.mails.lock().unwrap();
        assert_eq!(mails.len(), 1);
        assert_eq!(
            mails[0].recipients,
            vec!["private@infra.apache.org".to_string(), "alice@apache.org".to_string()]
        );
        assert!(recorder.chats.lock().unwrap()[0].contains("`commits@httpd.apache.org`"));

        let again = svc.request(&pmc_actor(), &form(good()), 1000).await;
        assert!(matches!(again, Err(RequestError::Conflict(_))));
    }

    #[tokio::test]
    async fn committers_without_pmc_are_refused() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp, Arc::new(Recorder::default()));
        let mut actor = Actor::new("bob");
        actor.projects = vec!["httpd".to_string()];
        let result = svc.request(&actor, &form(good()), 1000).await;
        assert!(matches!(result, Err(RequestError::Unauthorized(_))));
    }
}
