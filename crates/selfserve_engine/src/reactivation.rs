//! Reactivation of dormant downstream accounts.
//!
//! The requester proves ownership of the registered address by following a
//! mailed link. Tokens live in memory only; a restart simply forces a new
//! request.

use crate::error::{RequestError, Result};
use crate::executor::{Classifier, SideEffectExecutor};
use crate::kind::RequestKind;
use crate::lifecycle::Reply;
use crate::notify::{Notification, Notifier, Variables};
use crate::rate_limit::{RateLimiter, RATE_LIMITED_MESSAGE};
use crate::shutdown::Shutdown;
use crate::source::DataSource;
use crate::validate::field_str;
use crate::Fields;
use selfserve_ids::ReactivationToken;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

pub const TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;
pub const DIRECTORY_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Addresses under this domain are managed elsewhere.
const INTERNAL_DOMAIN: &str = "@apache.org";

const MSG_INTERNAL: &str = "Reactivation of internal ASF accounts cannot be done through this tool.";
const MSG_UNKNOWN_TOKEN: &str =
    "Your token could not be found in our database. Please resubmit your request.";
const MSG_LINK_SENT: &str =
    "A confirmation link has been sent to the email address registered with your account.";
const MSG_MAIL_FAILED: &str =
    "We could not send the confirmation email at this time. Please try again later.";

// ============================================================================
// Email directory
// ============================================================================

/// Username (lowercase) to registered email address, as known downstream.
#[derive(Debug, Default)]
pub struct EmailDirectory {
    entries: RwLock<Arc<HashMap<String, String>>>,
}

impl EmailDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a freshly loaded map. Blank names or addresses are dropped.
    pub fn replace(&self, entries: HashMap<String, String>) {
        let cleaned: HashMap<String, String> = entries
            .into_iter()
            .filter(|(user, email)| !user.trim().is_empty() && !email.trim().is_empty())
            .map(|(user, email)| (user.to_lowercase(), email))
            .collect();
        let next = Arc::new(cleaned);
        match self.entries.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn current(&self) -> Arc<HashMap<String, String>> {
        match self.entries.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn lookup(&self, username: &str) -> Option<String> {
        self.current().get(&username.to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reloads an [`EmailDirectory`] from a JSON object source.
pub struct DirectoryRefresher {
    pub directory: Arc<EmailDirectory>,
    pub source: DataSource,
    pub client: reqwest::Client,
}

impl DirectoryRefresher {
    pub async fn refresh_once(&self) -> anyhow::Result<usize> {
        let entries: HashMap<String, String> = self.source.fetch_json(&self.client).await?;
        self.directory.replace(entries);
        let count = self.directory.len();
        info!(source = %self.source, entries = count, "Email directory refreshed");
        Ok(count)
    }

    /// A failed refresh keeps the previous map until the next interval.
    pub async fn run(self, interval: Duration, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(source = %self.source, error = %e, "Email directory refresh failed, retrying later");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone)]
struct PendingActivation {
    username: String,
    expires_at: i64,
}

pub struct ReactivationService {
    kind: RequestKind,
    directory: Arc<EmailDirectory>,
    notifier: Arc<dyn Notifier>,
    executor: SideEffectExecutor,
    classifier: Classifier,
    rate_limiter: Arc<RateLimiter>,
    public_host: String,
    pending: Mutex<HashMap<String, PendingActivation>>,
}

impl ReactivationService {
    pub fn new(
        kind: RequestKind,
        directory: Arc<EmailDirectory>,
        notifier: Arc<dyn Notifier>,
        executor: SideEffectExecutor,
        rate_limiter: Arc<RateLimiter>,
        public_host: impl Into<String>,
    ) -> std::result::Result<Self, regex::Error> {
        let classifier = Classifier::new(
            &kind.activate_outcomes(),
            kind.failure_message(),
            kind.timeout_message(),
        )?;
        Ok(Self {
            kind,
            directory,
            notifier,
            executor,
            classifier,
            rate_limiter,
            public_host: public_host.into(),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn directory(&self) -> &Arc<EmailDirectory> {
        &self.directory
    }

    fn with_pending<R>(&self, f: impl FnOnce(&mut HashMap<String, PendingActivation>) -> R) -> R {
        match self.pending.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Number of unexpired confirmation tokens.
    pub fn pending_count(&self, now: i64) -> usize {
        self.with_pending(|map| map.values().filter(|p| p.expires_at > now).count())
    }

    /// Match username and address against the directory and mail a link.
    pub async fn request(&self, fields: &Fields, origin_ip: &str, now: i64) -> Result<Reply> {
        if !self.rate_limiter.check(origin_ip) {
            return Err(RequestError::RateLimited(RATE_LIMITED_MESSAGE.to_string()));
        }
        let username = field_str(fields, "username").unwrap_or_default().trim();
        let email = field_str(fields, "email").unwrap_or_default().trim();
        if email.to_lowercase().ends_with(INTERNAL_DOMAIN) {
            return Err(RequestError::validation(MSG_INTERNAL));
        }
        let matched = !username.is_empty()
            && self
                .directory
                .lookup(username)
                .is_some_and(|registered| registered.eq_ignore_ascii_case(email));
        if !matched {
            return Err(RequestError::not_found(format!(
                "We were unable to find the account based on the information provided. Either \
                 your {} account username, or the email address you registered it with, is \
                 incorrect.",
                self.kind.display_name
            )));
        }

        let token = ReactivationToken::new();
        self.with_pending(|map| {
            map.retain(|_, p| p.expires_at > now);
            map.insert(
                token.as_str().to_string(),
                PendingActivation {
                    username: username.to_lowercase(),
                    expires_at: now + TOKEN_LIFETIME_SECS,
                },
            );
        });

        let mut vars = Variables::new();
        vars.insert(
            "verify_url".to_string(),
            self.kind.reactivate_url(&self.public_host, token.as_str()),
        );
        vars.insert("userid".to_string(), username.to_string());
        vars.insert("system".to_string(), self.kind.display_name.clone());
        let mail = Notification::new(self.kind.template("reactivate"), vec![email.to_string()], vars)
            .start_thread(self.kind.activate_thread(token.as_str()));
        if let Err(e) = self.notifier.send(&mail).await {
            error!(kind = %self.kind.name, userid = username, error = %e, "Reactivation mail could not be sent");
            self.with_pending(|map| map.remove(token.as_str()));
            return Err(RequestError::downstream(MSG_MAIL_FAILED));
        }
        info!(kind = %self.kind.name, userid = username, "Reactivation link sent");
        Ok(Reply::ok(MSG_LINK_SENT))
    }

    /// Redeem a confirmation token and reactivate the account.
    ///
    /// The token is consumed before the command runs; a failed run needs a
    /// fresh request.
    pub async fn confirm(&self, token: &str, now: i64) -> Result<Reply> {
        let entry = self
            .with_pending(|map| map.remove(token.trim()))
            .filter(|p| p.expires_at > now)
            .ok_or_else(|| RequestError::not_found(MSG_UNKNOWN_TOKEN))?;
        let email = self
            .directory
            .lookup(&entry.username)
            .ok_or_else(|| RequestError::not_found(MSG_UNKNOWN_TOKEN))?;

        let argv = self.kind.activate_args(&entry.username, &email);
        let outcome = self.executor.execute(&argv, &self.classifier).await;
        if let Some(message) = outcome.failure_message() {
            warn!(kind = %self.kind.name, userid = %entry.username, "Account reactivation failed");
            return Err(RequestError::downstream(message));
        }
        info!(kind = %self.kind.name, userid = %entry.username, "Account reactivated");
        Ok(Reply::ok(format!(
            "Your {} account has been reactivated.",
            self.kind.display_name
        )))
    }
}
