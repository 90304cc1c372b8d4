//! Wiring: turns a [`PortalConfig`] into running services.

use crate::config::{PortalConfig, ReactivationConfig};
use anyhow::{Context, Result};
use selfserve_db::AccountDb;
use selfserve_engine::projects::CommitteeInfo;
use selfserve_engine::{
    reaper, CommandRunner, DataSource, DirectoryRefresher, EmailDirectory, EngineContext, JobQueue,
    MailingListService, Notifier, PortalNotifier, ProcessRunner, ProjectRefresher,
    ProjectRegistry, ProjectSnapshot, RateLimiter, ReactivationService, RequestEngine,
    RequestKind, ResourceService, SendmailTransport, Shutdown, SideEffectExecutor, SlackChat, TemplateStore,
    UseridRegistry,
};
use selfserve_logging::AuditLog;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything the HTTP layer and the admin commands need.
pub struct Portal {
    pub config: PortalConfig,
    pub engines: BTreeMap<String, Arc<RequestEngine>>,
    pub reactivations: BTreeMap<String, Arc<ReactivationService>>,
    pub directories: BTreeMap<String, Arc<EmailDirectory>>,
    pub mailing_lists: Arc<MailingListService>,
    pub resources: Arc<ResourceService>,
    pub queue: JobQueue,
    pub projects: Arc<ProjectRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub client: reqwest::Client,
}

/// Swappable collaborators; tests substitute fakes.
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub notifier: Arc<dyn Notifier>,
    pub client: reqwest::Client,
}

impl Collaborators {
    /// Real processes, sendmail (when configured) and Slack.
    pub fn from_config(config: &PortalConfig) -> Self {
        let client = reqwest::Client::new();
        let messaging = &config.messaging;
        let mail = messaging.sendmail.as_ref().map(|program| SendmailTransport {
            program: program.clone(),
            sender: messaging.sender.clone(),
            message_id_domain: messaging
                .message_id_domain
                .clone()
                .unwrap_or_else(|| config.server.public_host.clone()),
        });
        let chat = match (&messaging.slack_url, &messaging.slack_token, &messaging.slack_channel) {
            (Some(url), _, _) => Some(SlackChat::Webhook { url: url.clone() }),
            (None, Some(token), Some(channel)) => Some(SlackChat::Token {
                token: token.clone(),
                channel: channel.clone(),
            }),
            _ => None,
        };
        let notifier = PortalNotifier::new(
            TemplateStore::new(messaging.template_dir.clone()),
            mail,
            chat,
            client.clone(),
        );
        Self {
            runner: Arc::new(ProcessRunner),
            notifier: Arc::new(notifier),
            client,
        }
    }
}

impl Portal {
    /// Open stores and build services. Nothing runs until
    /// [`Portal::spawn_background`].
    pub async fn build(config: PortalConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            runner,
            notifier,
            client,
        } = collaborators;

        let projects = Arc::new(ProjectRegistry::new(
            ProjectSnapshot::build(
                &CommitteeInfo::default(),
                &config.projects.extra,
                &config.projects.base_domains,
                &config.messaging.mail_domain,
            ),
            config.messaging.mail_domain.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.server.rate_limit_per_ip));
        let userid_registry = config
            .projects
            .userid_registry
            .as_ref()
            .map(|url| UseridRegistry::new(url.clone(), client.clone()));
        let ctx = EngineContext {
            projects: projects.clone(),
            notifier: notifier.clone(),
            rate_limiter: rate_limiter.clone(),
            public_host: config.server.public_host.clone(),
            notification_target: config.messaging.notification_target.clone(),
            userid_registry,
        };

        let mut engines = BTreeMap::new();
        let mut reactivations = BTreeMap::new();
        let mut directories = BTreeMap::new();
        for kind in config.kinds()? {
            let executor = executor_for(&config, &kind, runner.clone())?;
            let db = open_db(&config, &kind).await?;

            if config.reactivation.contains_key(&kind.name) {
                let directory = Arc::new(EmailDirectory::new());
                let service = ReactivationService::new(
                    kind.clone(),
                    directory.clone(),
                    notifier.clone(),
                    executor.clone(),
                    rate_limiter.clone(),
                    config.server.public_host.clone(),
                )
                .context("Invalid reactivation outcome rules")?;
                directories.insert(kind.name.clone(), directory);
                reactivations.insert(kind.name.clone(), Arc::new(service));
            }

            info!(kind = %kind.name, table_prefix = %kind.table_prefix, "Account system ready");
            let name = kind.name.clone();
            let engine = RequestEngine::new(kind, db, ctx.clone(), executor)
                .with_context(|| format!("Invalid outcome rules for '{}'", name))?;
            engines.insert(name, Arc::new(engine));
        }

        let queue = JobQueue::new(config.storage.queue_dir.clone());
        let mailing_lists = Arc::new(
            MailingListService::new(
                projects.clone(),
                queue.clone(),
                notifier.clone(),
                config.messaging.mail_domain.clone(),
            )
            .context("Failed to build mailing list service")?,
        );

        let resources_audit = AuditLog::open(config.storage.audit_dir().to_path_buf(), "resources_acli")
            .context("Failed to open audit log for space and project administration")?;
        let resources = Arc::new(
            ResourceService::new(
                config.resources.clone(),
                SideEffectExecutor::new(
                    runner.clone(),
                    Some(resources_audit),
                    Duration::from_secs(config.resources.timeout_secs),
                ),
                projects.clone(),
                notifier.clone(),
                config.messaging.mail_domain.clone(),
            )
            .context("Failed to build resource service")?,
        );

        Ok(Self {
            config,
            engines,
            reactivations,
            directories,
            mailing_lists,
            resources,
            queue,
            projects,
            rate_limiter,
            client,
        })
    }

    pub fn engine(&self, name: &str) -> Option<&Arc<RequestEngine>> {
        self.engines.get(name)
    }

    /// Start every periodic job. They stop when `shutdown` fires.
    pub fn spawn_background(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for engine in self.engines.values() {
            handles.push(tokio::spawn(reaper::run_reaper(
                engine.db().clone(),
                self.config.reaper,
                shutdown.clone(),
            )));
        }

        handles.push(tokio::spawn(self.rate_limiter.clone().run_reset_loop(
            selfserve_engine::rate_limit::RESET_INTERVAL,
            shutdown.clone(),
        )));

        let refresher = ProjectRefresher {
            registry: self.projects.clone(),
            committee_info: self.config.projects.committee_info.as_deref().map(DataSource::parse),
            mailing_lists: self.config.projects.mailing_lists.as_deref().map(DataSource::parse),
            extra_projects: self.config.projects.extra.clone(),
            base_domains: self.config.projects.base_domains.clone(),
            mail_suffix: self.config.messaging.mail_domain.clone(),
            client: self.client.clone(),
        };
        handles.push(tokio::spawn(refresher.run(
            Duration::from_secs(self.config.projects.refresh_interval_secs.max(1)),
            shutdown.clone(),
        )));

        for (name, directory) in &self.directories {
            if let Some(settings) = self.config.reactivation.get(name) {
                handles.push(spawn_directory_refresh(
                    directory.clone(),
                    settings,
                    self.client.clone(),
                    shutdown.clone(),
                ));
            }
        }

        handles
    }
}

fn spawn_directory_refresh(
    directory: Arc<EmailDirectory>,
    settings: &ReactivationConfig,
    client: reqwest::Client,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    let refresher = DirectoryRefresher {
        directory,
        source: DataSource::parse(&settings.directory),
        client,
    };
    tokio::spawn(refresher.run(
        Duration::from_secs(settings.refresh_interval_secs.max(1)),
        shutdown,
    ))
}

fn executor_for(
    config: &PortalConfig,
    kind: &RequestKind,
    runner: Arc<dyn CommandRunner>,
) -> Result<SideEffectExecutor> {
    let audit = AuditLog::open(
        config.storage.audit_dir().to_path_buf(),
        &format!("{}_acli", kind.table_prefix),
    )
    .with_context(|| format!("Failed to open audit log for '{}'", kind.name))?;
    Ok(SideEffectExecutor::new(
        runner,
        Some(audit),
        Duration::from_secs(kind.timeout_secs),
    ))
}

/// `<db_dir>/<name>.db`, tables prefixed with the kind's table prefix.
pub fn db_path(config: &PortalConfig, kind: &RequestKind) -> PathBuf {
    config.storage.db_dir.join(format!("{}.db", kind.name))
}

pub async fn open_db(config: &PortalConfig, kind: &RequestKind) -> Result<AccountDb> {
    let path = db_path(config, kind);
    AccountDb::open(&path, &kind.table_prefix)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}
