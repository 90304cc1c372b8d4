//! The pending-request state machine.
//!
//! ```text
//! submit ──► SUBMITTED ──verify──► VERIFIED ──approve──► (row deleted, id known)
//!                                      │
//!                                      └──deny──► VERIFIED + denied_at ──reaper──► (row deleted)
//! ```
//!
//! Every guarding write is a single conditional statement in the record
//! store. Approval additionally holds an in-process claim on the token for
//! the whole downstream call:
//!
//! - a second approval of a claimed token is refused before the executor runs
//! - a denial of a claimed token is refused, so a request is never both
//!   provisioned and reported as denied
//!
//! Notification failures never undo a transition. They are logged with
//! the request id and token.

use crate::actor::Actor;
use crate::error::{RequestError, Result};
use crate::executor::{Classifier, SideEffectExecutor};
use crate::kind::RequestKind;
use crate::notify::{Notification, Notifier, Variables};
use crate::projects::ProjectRegistry;
use crate::rate_limit::{RateLimiter, RATE_LIMITED_MESSAGE};
use crate::userid::UseridRegistry;
use crate::validate::Validator;
use crate::Fields;
use selfserve_db::{AccountDb, DbError, NewPendingRequest, PendingRequest};
use selfserve_ids::RequestToken;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub const DEFAULT_NOTIFICATION_TARGET: &str = "notifications@infra.apache.org";

const MSG_SUBMITTED: &str = "Request logged. Please verify your email address";
const MSG_VERIFIED: &str = "Your email address has been validated.";
const MSG_BAD_VERIFY_TOKEN: &str = "Unknown or already validated token sent.";
const MSG_BAD_TOKEN_FORMAT: &str = "Invalid token format";
const MSG_NO_REVIEWABLE: &str =
    "Could not find the pending account request. It may have already been reviewed.";
const MSG_NOT_ON_PROJECT: &str =
    "You can only review account requests related to the projects you are on";
const MSG_ALREADY_DENIED: &str = "This account request has already been denied.";
const MSG_IN_FLIGHT: &str = "This account request is already being processed.";
const MSG_CREATED: &str = "Account created, welcome email has been dispatched.";
const MSG_DENIED: &str = "Account denied, notification dispatched.";
const MSG_NO_REASON: &str = "No reason given.";
const MSG_TAKEN: &str = "The username you selected is already in use";
const MSG_QUERY_FAILED: &str = "Your query could not be completed at this point. Please retry later.";

// ============================================================================
// Replies
// ============================================================================

/// `{success, message}` reply of a state-changing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    pub message: String,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub token: RequestToken,
    pub request_id: String,
    /// False when the verification mail could not be handed off
    pub notified: bool,
    pub reply: Reply,
}

/// What a reviewer sees. Email address and token stay private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewView {
    pub created: i64,
    pub project: String,
    pub userid: String,
    pub realname: String,
    pub userip: String,
    pub why: String,
    pub denied: Option<i64>,
}

impl From<&PendingRequest> for ReviewView {
    fn from(request: &PendingRequest) -> Self {
        Self {
            created: request.created_at,
            project: request.scope.clone(),
            userid: request.request_id.clone(),
            realname: request.field("realname").to_string(),
            userip: request.origin_ip.clone(),
            why: request.field("why").to_string(),
            denied: request.denied_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Deny,
}

impl std::str::FromStr for ReviewAction {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "approve" => Ok(ReviewAction::Approve),
            "deny" => Ok(ReviewAction::Deny),
            other => Err(RequestError::validation(format!(
                "Unknown review action: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Collaborators shared by every request kind.
#[derive(Clone)]
pub struct EngineContext {
    pub projects: Arc<ProjectRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Host used in links mailed to people
    pub public_host: String,
    /// Operations address copied on reviewer mail
    pub notification_target: String,
    pub userid_registry: Option<UseridRegistry>,
}

/// Lifecycle engine for one request kind.
pub struct RequestEngine {
    kind: RequestKind,
    db: AccountDb,
    ctx: EngineContext,
    validator: Validator,
    executor: SideEffectExecutor,
    classifier: Classifier,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases an approval claim when dropped.
struct ApprovalClaim<'a> {
    claims: &'a Mutex<HashSet<String>>,
    token: String,
}

impl Drop for ApprovalClaim<'_> {
    fn drop(&mut self) {
        match self.claims.lock() {
            Ok(mut set) => {
                set.remove(&self.token);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.token);
            }
        }
    }
}

impl RequestEngine {
    pub fn new(
        kind: RequestKind,
        db: AccountDb,
        ctx: EngineContext,
        executor: SideEffectExecutor,
    ) -> std::result::Result<Self, regex::Error> {
        let classifier = Classifier::new(&kind.outcomes, kind.failure_message(), kind.timeout_message())?;
        Ok(Self {
            validator: Validator::new()?,
            kind,
            db,
            ctx,
            executor,
            classifier,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn db(&self) -> &AccountDb {
        &self.db
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // Requester side
    // ------------------------------------------------------------------

    /// Validate and store a new request, then mail the verification link.
    pub async fn submit(&self, fields: &Fields, origin_ip: &str) -> Result<Submitted> {
        self.rate_gate(origin_ip)?;

        let submission = self
            .validator
            .validate(&self.kind, fields, &self.db, &self.ctx.projects)
            .await?;

        let token = RequestToken::new();
        let record = NewPendingRequest {
            request_id: submission.username.clone(),
            token: token.as_str().to_string(),
            contact_email: submission.email.clone(),
            scope: submission.project.clone(),
            fields: submission.subject_fields(),
            created_at: AccountDb::now_secs(),
            origin_ip: origin_ip.to_string(),
        };
        match self.db.insert_pending(&record).await {
            Ok(()) => {}
            // Lost a race against an identical submission after validation.
            Err(DbError::Constraint(_)) => return Err(RequestError::validation(MSG_TAKEN)),
            Err(e) => return Err(e.into()),
        }
        info!(
            kind = %self.kind.name,
            request_id = %record.request_id,
            token = %token,
            project = %record.scope,
            "Account request submitted"
        );

        let mut vars = self.base_vars();
        vars.insert(
            "verify_url".to_string(),
            self.kind.verify_url(&self.ctx.public_host, token.as_str()),
        );
        vars.insert("userid".to_string(), record.request_id.clone());
        vars.insert("realname".to_string(), submission.realname.clone());
        let notification = Notification::new(
            self.kind.template("verify"),
            vec![record.contact_email.clone()],
            vars,
        )
        .start_thread(self.kind.user_thread(token.as_str()));

        let notified = match self.ctx.notifier.send(&notification).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    kind = %self.kind.name,
                    request_id = %record.request_id,
                    token = %token,
                    error = %e,
                    "Verification mail could not be sent"
                );
                false
            }
        };

        let reply = if notified {
            Reply::ok(MSG_SUBMITTED)
        } else {
            Reply::ok(format!(
                "Request logged, but the verification email could not be sent. \
                 Please contact the infrastructure team and quote request id '{}'.",
                record.request_id
            ))
        };
        Ok(Submitted {
            token,
            request_id: record.request_id,
            notified,
            reply,
        })
    }

    /// Redeem the verification link.
    pub async fn verify(&self, token: &str) -> Result<Reply> {
        let token = RequestToken::parse(token.trim())
            .map_err(|_| RequestError::not_found(MSG_BAD_VERIFY_TOKEN))?;
        let record = self
            .db
            .pending_by_token(token.as_str())
            .await?
            .ok_or_else(|| RequestError::not_found(MSG_BAD_VERIFY_TOKEN))?;
        if record.is_verified() {
            return Err(RequestError::conflict(MSG_BAD_VERIFY_TOKEN));
        }
        if !self.db.mark_verified(token.as_str()).await? {
            // Someone else verified between the read and the update.
            return Err(RequestError::conflict(MSG_BAD_VERIFY_TOKEN));
        }

        let mut vars = self.record_vars(&record);
        vars.insert(
            "review_url".to_string(),
            self.kind.review_url(&self.ctx.public_host, token.as_str()),
        );
        let notification = Notification::new(
            self.kind.template("pending_review"),
            self.reviewer_recipients(&record.scope),
            vars,
        )
        .start_thread(self.kind.pmc_thread(token.as_str()));
        self.notify_logged(&notification, &record).await;

        Ok(Reply::ok(MSG_VERIFIED))
    }

    // ------------------------------------------------------------------
    // Reviewer side
    // ------------------------------------------------------------------

    pub async fn review_fetch(&self, token: &str, actor: &Actor) -> Result<ReviewView> {
        let record = self.load_reviewable(token, actor).await?;
        Ok(ReviewView::from(&record))
    }

    pub async fn review_action(
        &self,
        token: &str,
        actor: &Actor,
        action: ReviewAction,
        reason: Option<&str>,
    ) -> Result<Reply> {
        match action {
            ReviewAction::Approve => self.review_approve(token, actor).await,
            ReviewAction::Deny => self.review_deny(token, actor, reason).await,
        }
    }

    /// Create the downstream account and retire the request.
    pub async fn review_approve(&self, token: &str, actor: &Actor) -> Result<Reply> {
        let record = self.load_reviewable(token, actor).await?;
        if record.is_denied() {
            return Err(RequestError::conflict(MSG_ALREADY_DENIED));
        }
        let _claim = self
            .claim(&record.token)
            .ok_or_else(|| RequestError::conflict(MSG_IN_FLIGHT))?;

        let argv = self
            .kind
            .create_argv(&record.request_id, record.field("realname"), &record.contact_email);
        let outcome = self.executor.execute(&argv, &self.classifier).await;
        if let Some(message) = outcome.failure_message() {
            warn!(
                kind = %self.kind.name,
                request_id = %record.request_id,
                approver = %actor.uid,
                "Account creation failed: {}",
                message
            );
            return Err(RequestError::downstream(message));
        }

        let now = AccountDb::now_secs();
        if !self
            .db
            .promote_to_known(&record.token, &record.request_id, now)
            .await?
        {
            // Row vanished while the command ran (reaped). The account
            // exists downstream, so record it anyway.
            warn!(request_id = %record.request_id, "Approved request was no longer pending");
            self.db.insert_known(&record.request_id, now).await?;
        }
        info!(
            kind = %self.kind.name,
            request_id = %record.request_id,
            approver = %actor.uid,
            "Account request approved"
        );

        let vars = self.record_vars(&record);
        let welcome = Notification::new(
            self.kind.template("welcome"),
            vec![record.contact_email.clone()],
            vars.clone(),
        )
        .in_thread(self.kind.user_thread(&record.token));
        self.notify_logged(&welcome, &record).await;

        let mut pmc_vars = vars;
        pmc_vars.insert("approver".to_string(), actor.uid.clone());
        let pmc = Notification::new(
            self.kind.template("welcome_pmc"),
            self.reviewer_recipients(&record.scope),
            pmc_vars,
        )
        .in_thread(self.kind.pmc_thread(&record.token));
        self.notify_logged(&pmc, &record).await;

        Ok(Reply::ok(MSG_CREATED))
    }

    /// Mark the request denied; the reaper removes it a day later.
    pub async fn review_deny(&self, token: &str, actor: &Actor, reason: Option<&str>) -> Result<Reply> {
        let record = self.load_reviewable(token, actor).await?;
        if record.is_denied() {
            return Err(RequestError::conflict(MSG_ALREADY_DENIED));
        }
        if self.is_claimed(&record.token) {
            return Err(RequestError::conflict(MSG_IN_FLIGHT));
        }
        if !self.db.mark_denied(&record.token, AccountDb::now_secs()).await? {
            return Err(RequestError::conflict(MSG_ALREADY_DENIED));
        }
        info!(
            kind = %self.kind.name,
            request_id = %record.request_id,
            approver = %actor.uid,
            "Account request denied"
        );

        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(MSG_NO_REASON);
        let mut vars = self.record_vars(&record);
        vars.insert("reason".to_string(), reason.to_string());

        let to_requester = Notification::new(
            self.kind.template("denied"),
            vec![record.contact_email.clone()],
            vars.clone(),
        )
        .in_thread(self.kind.user_thread(&record.token));
        self.notify_logged(&to_requester, &record).await;

        vars.insert("approver".to_string(), actor.uid.clone());
        let to_pmc = Notification::new(
            self.kind.template("denied_pmc"),
            self.reviewer_recipients(&record.scope),
            vars,
        )
        .in_thread(self.kind.pmc_thread(&record.token));
        self.notify_logged(&to_pmc, &record).await;

        Ok(Reply::ok(MSG_DENIED))
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Whether a username is taken, locally or in the external registry.
    pub async fn check_exists(&self, userid: &str, origin_ip: &str) -> Result<bool> {
        self.rate_gate(origin_ip)?;
        let userid = userid.trim();
        if userid.is_empty() {
            return Err(RequestError::validation("Please provide a username to check"));
        }
        if self.db.known_exists(userid).await? || self.db.pending_exists(userid).await? {
            return Ok(true);
        }
        match &self.ctx.userid_registry {
            Some(registry) => registry.exists(userid).await.map_err(|e| {
                warn!(userid, error = %e, "Userid registry lookup failed");
                RequestError::downstream(MSG_QUERY_FAILED)
            }),
            None => Ok(false),
        }
    }

    pub async fn check_scope_blocked(&self, scope: &str, origin_ip: &str) -> Result<bool> {
        self.rate_gate(origin_ip)?;
        let scope = scope.trim();
        if scope.is_empty() {
            return Ok(false);
        }
        Ok(self.db.scope_blocked(scope).await?)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn rate_gate(&self, origin_ip: &str) -> Result<()> {
        if self.ctx.rate_limiter.check(origin_ip) {
            Ok(())
        } else {
            Err(RequestError::RateLimited(RATE_LIMITED_MESSAGE.to_string()))
        }
    }

    /// Well-formed token, verified record, actor on the project. "Missing"
    /// and "not verified" share one reply.
    async fn load_reviewable(&self, token: &str, actor: &Actor) -> Result<PendingRequest> {
        let token = RequestToken::parse(token.trim())
            .map_err(|_| RequestError::validation(MSG_BAD_TOKEN_FORMAT))?;
        let record = match self.db.pending_by_token(token.as_str()).await? {
            Some(record) if record.is_verified() => record,
            _ => return Err(RequestError::not_found(MSG_NO_REVIEWABLE)),
        };
        if !actor.can_review(&record.scope) {
            warn!(
                actor = %actor.uid,
                project = %record.scope,
                "Review attempt outside actor's projects"
            );
            return Err(RequestError::unauthorized(MSG_NOT_ON_PROJECT));
        }
        Ok(record)
    }

    fn claim(&self, token: &str) -> Option<ApprovalClaim<'_>> {
        let inserted = match self.in_flight.lock() {
            Ok(mut set) => set.insert(token.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(token.to_string()),
        };
        inserted.then(|| ApprovalClaim {
            claims: &self.in_flight,
            token: token.to_string(),
        })
    }

    fn is_claimed(&self, token: &str) -> bool {
        match self.in_flight.lock() {
            Ok(set) => set.contains(token),
            Err(poisoned) => poisoned.into_inner().contains(token),
        }
    }

    fn reviewer_recipients(&self, scope: &str) -> Vec<String> {
        vec![
            self.ctx.notification_target.clone(),
            self.ctx.projects.private_list(scope),
        ]
    }

    fn base_vars(&self) -> Variables {
        let mut vars = self.kind.template_vars.clone();
        vars.insert("system".to_string(), self.kind.display_name.clone());
        vars.insert("host".to_string(), self.ctx.public_host.clone());
        vars
    }

    fn record_vars(&self, record: &PendingRequest) -> Variables {
        let mut vars = self.base_vars();
        for (key, value) in &record.fields {
            vars.insert(key.clone(), value.clone());
        }
        vars.insert("userid".to_string(), record.request_id.clone());
        vars.insert("email".to_string(), record.contact_email.clone());
        vars.insert("project".to_string(), record.scope.clone());
        vars.insert("created".to_string(), record.created_at.to_string());
        vars.insert("userip".to_string(), record.origin_ip.clone());
        vars.insert("token".to_string(), record.token.clone());
        vars
    }

    async fn notify_logged(&self, notification: &Notification, record: &PendingRequest) {
        if let Err(e) = self.ctx.notifier.send(notification).await {
            error!(
                kind = %self.kind.name,
                request_id = %record.request_id,
                token = %record.token,
                template = %notification.template,
                error = %e,
                "Notification could not be sent"
            );
        }
    }
}
