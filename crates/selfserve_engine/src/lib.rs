//! Request lifecycle engine for the selfserve portal.
//!
//! One [`RequestEngine`] per downstream system, configured by a
//! [`RequestKind`]. Everything stateful that outlives a request (rate
//! buckets, project registry, email directory, reactivation tokens) is an
//! owned service passed in by the binary.

pub mod actor;
pub mod error;
pub mod executor;
pub mod kind;
pub mod lifecycle;
pub mod mailinglist;
pub mod notify;
pub mod projects;
pub mod queue;
pub mod rate_limit;
pub mod reactivation;
pub mod reaper;
pub mod resources;
pub mod shutdown;
pub mod source;
pub mod userid;
pub mod validate;

/// Raw request fields, merged from query string, form and JSON body.
pub type Fields = serde_json::Map<String, serde_json::Value>;

pub use actor::Actor;
pub use error::{RequestError, Result};
pub use executor::{
    Classifier, CommandOutput, CommandRunner, ExecError, Outcome, ProcessRunner, SideEffectExecutor,
};
pub use kind::{ConflictRule, OutcomeRules, RequestKind};
pub use lifecycle::{
    EngineContext, Reply, RequestEngine, ReviewAction, ReviewView, Submitted,
    DEFAULT_NOTIFICATION_TARGET,
};
pub use mailinglist::{MailingListJob, MailingListService};
pub use notify::{
    Notification, Notifier, PortalNotifier, SendmailTransport, SlackChat, TemplateStore, Variables,
};
pub use projects::{ProjectRefresher, ProjectRegistry, ProjectSnapshot};
pub use queue::{JobQueue, QueueError};
pub use rate_limit::RateLimiter;
pub use reactivation::{DirectoryRefresher, EmailDirectory, ReactivationService};
pub use reaper::{reap_once, run_reaper, ReaperSettings, SweepStats};
pub use resources::{ResourceService, ResourceSettings};
pub use shutdown::Shutdown;
pub use source::DataSource;
pub use userid::UseridRegistry;
pub use validate::{Submission, Validator};
