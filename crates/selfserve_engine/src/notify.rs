//! Outbound notifications: templated mail and chat messages.
//!
//! A template file holds `subject -- body`. Both halves use `{name}`
//! placeholders; `{{` and `}}` produce literal braces. A placeholder with
//! no matching variable is an error, so a broken template fails loudly
//! instead of mailing half-rendered text.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub type Variables = BTreeMap<String, String>;

/// One templated mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub template: String,
    pub recipients: Vec<String>,
    pub variables: Variables,
    /// First mail of a thread (sets the Message-ID from the key)
    pub thread_start: bool,
    pub thread_key: Option<String>,
}

impl Notification {
    pub fn new(template: impl Into<String>, recipients: Vec<String>, variables: Variables) -> Self {
        Self {
            template: template.into(),
            recipients,
            variables,
            thread_start: false,
            thread_key: None,
        }
    }

    pub fn start_thread(mut self, key: impl Into<String>) -> Self {
        self.thread_start = true;
        self.thread_key = Some(key.into());
        self
    }

    pub fn in_thread(mut self, key: impl Into<String>) -> Self {
        self.thread_start = false;
        self.thread_key = Some(key.into());
        self
    }
}

/// Delivery seam used by the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;

    async fn post_chat(&self, text: &str) -> Result<()>;
}

// ============================================================================
// Templates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub subject: String,
    pub body: String,
}

/// Substitute `{name}` placeholders.
pub fn render_template(text: &str, vars: &Variables) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => bail!("Unterminated placeholder {{{}", name),
                    }
                }
                let value = vars
                    .get(name.trim())
                    .ok_or_else(|| anyhow!("Template variable '{}' is not set", name.trim()))?;
                out.push_str(value);
            }
            '}' => bail!("Single '}}' in template"),
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Directory of `subject -- body` templates.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn render(&self, template: &str, vars: &Variables) -> Result<RenderedMail> {
        if template.contains('/') || template.contains("..") {
            bail!("Invalid template name {}", template);
        }
        let path = self.dir.join(template);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Could not find template {}", path.display()))?;
        let (subject, body) = raw
            .split_once("--")
            .ok_or_else(|| anyhow!("Template {} has no subject separator", template))?;
        Ok(RenderedMail {
            subject: render_template(subject.trim(), vars)?,
            body: render_template(body.trim(), vars)?,
        })
    }
}

// ============================================================================
// Mail transport
// ============================================================================

/// Hands RFC 5322 messages to a local sendmail binary.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    pub program: PathBuf,
    pub sender: String,
    /// Right-hand side of generated Message-IDs
    pub message_id_domain: String,
}

impl SendmailTransport {
    pub fn compose(&self, notification: &Notification, mail: &RenderedMail) -> String {
        let mut headers = Vec::new();
        headers.push(format!("From: {}", header_safe(&self.sender)));
        headers.push(format!(
            "To: {}",
            header_safe(&notification.recipients.join(", "))
        ));
        headers.push(format!("Subject: {}", header_safe(&mail.subject)));
        headers.push(format!("Date: {}", chrono::Utc::now().to_rfc2822()));

        match &notification.thread_key {
            Some(key) => {
                let thread_id = format!("<{}@{}>", header_safe(key), self.message_id_domain);
                if notification.thread_start {
                    headers.push(format!("Message-ID: {}", thread_id));
                } else {
                    headers.push(format!("Message-ID: {}", self.fresh_message_id()));
                    headers.push(format!("In-Reply-To: {}", thread_id));
                    headers.push(format!("References: {}", thread_id));
                }
            }
            None => headers.push(format!("Message-ID: {}", self.fresh_message_id())),
        }
        headers.push("MIME-Version: 1.0".to_string());
        headers.push("Content-Type: text/plain; charset=utf-8".to_string());
        headers.push("Content-Transfer-Encoding: 8bit".to_string());

        format!("{}\r\n\r\n{}\r\n", headers.join("\r\n"), mail.body)
    }

    fn fresh_message_id(&self) -> String {
        format!("<{}@{}>", uuid::Uuid::new_v4().simple(), self.message_id_domain)
    }

    pub async fn deliver(&self, notification: &Notification, mail: &RenderedMail) -> Result<()> {
        let message = self.compose(notification, mail);
        let mut child = Command::new(&self.program)
            .args(["-t", "-oi", "-f", envelope_address(&self.sender)])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// `Name <addr>` -> `addr`
fn envelope_address(sender: &str) -> &str {
    match (sender.find('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender.trim(),
    }
}

// ============================================================================
// Chat transport
// ============================================================================

/// Slack incoming webhook, or bot token + channel.
#[derive(Debug, Clone)]
pub enum SlackChat {
    Webhook { url: String },
    Token { token: String, channel: String },
}

impl SlackChat {
    pub async fn post(&self, client: &reqwest::Client, text: &str) -> Result<()> {
        let resp = match self {
            SlackChat::Webhook { url } => {
                client
                    .post(url)
                    .json(&serde_json::json!({ "text": text }))
                    .send()
                    .await?
            }
            SlackChat::Token { token, channel } => {
                client
                    .post("https://slack.com/api/chat.postMessage")
                    .bearer_auth(token)
                    .json(&serde_json::json!({ "channel": channel, "text": text }))
                    .send()
                    .await?
            }
        };
        if !resp.status().is_success() {
            bail!("Slack returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

// ============================================================================
// Portal notifier
// ============================================================================

/// Renders templates and delivers them; logs instead when no transport is
/// configured.
pub struct PortalNotifier {
    templates: TemplateStore,
    mail: Option<SendmailTransport>,
    chat: Option<SlackChat>,
    client: reqwest::Client,
}

impl PortalNotifier {
    pub fn new(
        templates: TemplateStore,
        mail: Option<SendmailTransport>,
        chat: Option<SlackChat>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            templates,
            mail,
            chat,
            client,
        }
    }
}

#[async_trait]
impl Notifier for PortalNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if notification.recipients.is_empty() {
            bail!("Notification {} has no recipients", notification.template);
        }
        let mail = self
            .templates
            .render(&notification.template, &notification.variables)
            .await?;
        match &self.mail {
            Some(transport) => {
                transport.deliver(notification, &mail).await?;
                debug!(template = %notification.template, recipients = ?notification.recipients, "Mail sent");
            }
            None => {
                info!(
                    template = %notification.template,
                    recipients = ?notification.recipients,
                    subject = %mail.subject,
                    "Mail transport disabled, not sending"
                );
            }
        }
        Ok(())
    }

    async fn post_chat(&self, text: &str) -> Result<()> {
        match &self.chat {
            Some(chat) => chat.post(&self.client, text).await,
            None => {
                info!(text, "Chat transport disabled, not posting");
                Ok(())
            }
        }
    }
}
