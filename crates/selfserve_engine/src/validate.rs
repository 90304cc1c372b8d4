//! Ordered validation of a new account request.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. every required field present and a string
//! 2. shape: username length, username charset, real name, email
//! 3. project is known
//! 4. project has not opted out of the system
//! 5. reason is more than ten characters
//! 6. username not provisioned already
//! 7. username not pending
//! 8. email not used by another pending request
//!
//! Steps 1 and 2 never touch the record store.

use crate::error::{RequestError, Result};
use crate::kind::RequestKind;
use crate::projects::ProjectRegistry;
use crate::Fields;
use regex::Regex;
use selfserve_db::{AccountDb, SubjectFields};

pub const USERNAME_PATTERN: &str = r"^[^<>&%\s]{4,20}$";
pub const EMAIL_PATTERN: &str = r"^[^@]+@[^@]+\.[^@]+$";

const REQUIRED_FIELDS: [&str; 5] = ["username", "realname", "email", "project", "why"];

/// A request that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub username: String,
    pub realname: String,
    pub email: String,
    pub project: String,
    pub why: String,
}

impl Submission {
    /// Free-form fields persisted with the record.
    pub fn subject_fields(&self) -> SubjectFields {
        let mut fields = SubjectFields::new();
        fields.insert("realname".to_string(), self.realname.clone());
        fields.insert("why".to_string(), self.why.clone());
        fields
    }
}

/// String value of a request field, `None` when absent or not a string.
pub fn field_str<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(|v| v.as_str())
}

pub struct Validator {
    username: Regex,
    email: Regex,
}

impl Validator {
    pub fn new() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            username: Regex::new(USERNAME_PATTERN)?,
            email: Regex::new(EMAIL_PATTERN)?,
        })
    }

    pub fn is_valid_email(&self, email: &str) -> bool {
        self.email.is_match(email)
    }

    /// Steps 1 and 2.
    pub fn check_shape(&self, kind: &RequestKind, fields: &Fields) -> Result<Submission> {
        for name in REQUIRED_FIELDS {
            if field_str(fields, name).is_none() {
                return Err(RequestError::validation(format!(
                    "Missing required field: {}",
                    name
                )));
            }
        }
        let get = |name: &str| field_str(fields, name).unwrap_or_default().to_string();
        let submission = Submission {
            username: get("username"),
            realname: get("realname"),
            email: get("email"),
            project: get("project"),
            why: get("why"),
        };

        if submission.username.chars().count() < 4 {
            return Err(RequestError::validation(format!(
                "{} Username should at least be four character long",
                kind.display_name
            )));
        }
        if !self.username.is_match(&submission.username) {
            return Err(RequestError::validation(format!(
                "Your {} username contains invalid characters, or is too long",
                kind.display_name
            )));
        }
        if submission.realname.chars().count() < 3 {
            return Err(RequestError::validation(
                "Your public (real) name must be at least three characters long",
            ));
        }
        if !self.is_valid_email(&submission.email) {
            return Err(RequestError::validation("Please enter a valid email address"));
        }
        Ok(submission)
    }

    /// All steps.
    pub async fn validate(
        &self,
        kind: &RequestKind,
        fields: &Fields,
        db: &AccountDb,
        projects: &ProjectRegistry,
    ) -> Result<Submission> {
        let submission = self.check_shape(kind, fields)?;

        if !projects.is_known_project(&submission.project) {
            return Err(RequestError::validation("Please select a valid project"));
        }
        if db.scope_blocked(&submission.project).await? {
            return Err(RequestError::validation(format!(
                "The project you have selected does not use {}. Please contact the project \
                 to find out what {} it uses.",
                kind.display_name, kind.system_noun
            )));
        }
        if submission.why.chars().count() <= 10 {
            return Err(RequestError::validation(format!(
                "Please write a valid reason why you want a {} account. Make sure it contains \
                 enough information for reviewers to properly assess your request.",
                kind.display_name
            )));
        }
        if db.known_exists(&submission.username).await?
            || db.pending_exists(&submission.username).await?
        {
            return Err(RequestError::validation(
                "The username you selected is already in use",
            ));
        }
        if db.pending_email_exists(&submission.email).await? {
            return Err(RequestError::validation(format!(
                "There is already a pending {} account request associated with this email \
                 address. Please wait for it to be processed",
                kind.display_name
            )));
        }
        Ok(submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::{default_base_domains, CommitteeInfo, ProjectSnapshot};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn good() -> serde_json::Value {
        json!({
            "username": "alice",
            "realname": "Alice Example",
            "email": "alice@example.org",
            "project": "httpd",
            "why": "I want to edit the httpd wiki pages"
        })
    }

    fn with(key: &str, value: serde_json::Value) -> Fields {
        let mut f = fields(good());
        f.insert(key.to_string(), value);
        f
    }

    fn message(err: RequestError) -> String {
        match err {
            RequestError::Validation(msg) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    fn projects() -> ProjectRegistry {
        ProjectRegistry::new(
            ProjectSnapshot::build(
                &CommitteeInfo::default(),
                &["httpd".to_string(), "kafka".to_string()],
                &default_base_domains(),
                "apache.org",
            ),
            "apache.org",
        )
    }

    #[test]
    fn shape_checks_in_order() {
        let v = Validator::new().unwrap();
        let kind = RequestKind::confluence();

        assert!(v.check_shape(&kind, &fields(good())).is_ok());

        let mut missing = fields(good());
        missing.remove("why");
        assert_eq!(message(v.check_shape(&kind, &missing).unwrap_err()), "Missing required field: why");
        assert_eq!(
            message(v.check_shape(&kind, &with("email", json!(42))).unwrap_err()),
            "Missing required field: email"
        );

        assert_eq!(
            message(v.check_shape(&kind, &with("username", json!("abc"))).unwrap_err()),
            "Confluence Username should at least be four character long"
        );
        for bad in ["al ice", "a<bcd", "abc&d", "50%off", "abcdefghijklmnopqrstu"] {
            assert_eq!(
                message(v.check_shape(&kind, &with("username", json!(bad))).unwrap_err()),
                "Your Confluence username contains invalid characters, or is too long",
                "{bad}"
            );
        }
        assert!(message(v.check_shape(&kind, &with("realname", json!("Al"))).unwrap_err())
            .contains("at least three characters"));
        for bad in ["alice", "a@b", "a@@b.c", "@example.org"] {
            assert_eq!(
                message(v.check_shape(&kind, &with("email", json!(bad))).unwrap_err()),
                "Please enter a valid email address",
                "{bad}"
            );
        }
        // the reason is checked against the store-backed steps, not here
        assert!(v.check_shape(&kind, &with("why", json!("short"))).is_ok());
    }

    #[test]
    fn first_failure_wins() {
        let v = Validator::new().unwrap();
        let kind = RequestKind::jira();
        let mut f = fields(good());
        f.insert("username".to_string(), json!("ab"));
        f.insert("email".to_string(), json!("broken"));
        assert_eq!(
            message(v.check_shape(&kind, &f).unwrap_err()),
            "Jira Username should at least be four character long"
        );
    }

    #[tokio::test]
    async fn store_checks_in_order() {
        let v = Validator::new().unwrap();
        let kind = RequestKind::confluence();
        let db = AccountDb::open_memory("cwiki").await.unwrap();
        let projects = projects();

        assert!(v.validate(&kind, &fields(good()), &db, &projects).await.is_ok());

        let err = v
            .validate(&kind, &with("project", json!("nosuchproject")), &db, &projects)
            .await
            .unwrap_err();
        assert_eq!(message(err), "Please select a valid project");

        db.block_scope("kafka").await.unwrap();
        let err = v
            .validate(&kind, &with("project", json!("kafka")), &db, &projects)
            .await
            .unwrap_err();
        assert_eq!(
            message(err),
            "The project you have selected does not use Confluence. Please contact the project to find out what wiki it uses."
        );

        // A short reason loses to the blocked project, but beats a taken username.
        let mut short_why = with("project", json!("kafka"));
        short_why.insert("why".to_string(), json!("0123456789"));
        let err = v.validate(&kind, &short_why, &db, &projects).await.unwrap_err();
        assert!(message(err).starts_with("The project you have selected does not use"));

        db.insert_known("Alice", 1).await.unwrap();
        // exactly ten characters is too short
        let err = v
            .validate(&kind, &with("why", json!("0123456789")), &db, &projects)
            .await
            .unwrap_err();
        assert!(message(err).starts_with("Please write a valid reason"));

        let err = v
            .validate(&kind, &with("why", json!("01234567890")), &db, &projects)
            .await
            .unwrap_err();
        assert_eq!(message(err), "The username you selected is already in use");
    }

    #[tokio::test]
    async fn bad_username_reported_before_blocked_project() {
        let v = Validator::new().unwrap();
        let kind = RequestKind::confluence();
        let db = AccountDb::open_memory("cwiki").await.unwrap();
        let projects = projects();
        db.block_scope("httpd").await.unwrap();

        let f = with("username", json!("abc"));
        for _ in 0..5 {
            let err = v.validate(&kind, &f, &db, &projects).await.unwrap_err();
            assert_eq!(
                message(err),
                "Confluence Username should at least be four character long"
            );
        }
        assert_eq!(db.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_username_and_email_rejected() {
        let v = Validator::new().unwrap();
        let kind = RequestKind::confluence();
        let db = AccountDb::open_memory("cwiki").await.unwrap();
        let projects = projects();

        db.insert_pending(&selfserve_db::NewPendingRequest {
            request_id: "bobby".to_string(),
            token: "t-1".to_string(),
            contact_email: "alice@example.org".to_string(),
            scope: "httpd".to_string(),
            fields: SubjectFields::new(),
            created_at: 1,
            origin_ip: String::new(),
        })
        .await
        .unwrap();

        let err = v
            .validate(&kind, &with("username", json!("BOBBY")), &db, &projects)
            .await
            .unwrap_err();
        assert_eq!(message(err), "The username you selected is already in use");

        let err = v.validate(&kind, &fields(good()), &db, &projects).await.unwrap_err();
        assert!(message(err).starts_with("There is already a pending Confluence account request"));
    }
}
