//! Downstream side effects.
//!
//! The administration tool is run as a subprocess with a discrete argument
//! vector, never through a shell. Its exit code and output are classified
//! into an [`Outcome`], and every invocation lands in the audit log.

use crate::kind::OutcomeRules;
use async_trait::async_trait;
use regex::Regex;
use selfserve_logging::AuditLog;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

// ============================================================================
// Runner seam
// ============================================================================

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("program not found: {0}")]
    NotFound(String),

    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("failed to run command: {0}")]
    Io(#[from] io::Error),
}

/// Runs one command to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ExecError::NotFound(program.clone()),
                _ => ExecError::Io(e),
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::TimedOut(timeout))??;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Classified result of a side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Non-zero exit, but the output proves the work was done
    SoftSuccess,
    /// Known conflict marker; carries the user-facing message
    Conflict(String),
    /// Command did not finish in time
    TimedOut(String),
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::SoftSuccess)
    }

    /// User-facing failure message, `None` on success.
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Outcome::Success | Outcome::SoftSuccess => None,
            Outcome::Conflict(msg) | Outcome::TimedOut(msg) | Outcome::Failed(msg) => Some(msg),
        }
    }
}

enum Marker {
    Substring(String),
    Pattern(Regex),
}

impl Marker {
    fn found_in(&self, text: &str) -> bool {
        match self {
            Marker::Substring(s) => text.contains(s.as_str()),
            Marker::Pattern(re) => re.is_match(text),
        }
    }
}

/// [`OutcomeRules`] with patterns compiled.
pub struct Classifier {
    soft_success: Vec<String>,
    conflicts: Vec<(Marker, String)>,
    failure_message: String,
    timeout_message: String,
}

impl Classifier {
    pub fn new(
        rules: &OutcomeRules,
        failure_message: String,
        timeout_message: String,
    ) -> Result<Self, regex::Error> {
        let mut conflicts = Vec::with_capacity(rules.conflicts.len());
        for rule in &rules.conflicts {
            let marker = if rule.regex {
                Marker::Pattern(Regex::new(&rule.pattern)?)
            } else {
                Marker::Substring(rule.pattern.clone())
            };
            conflicts.push((marker, rule.message.clone()));
        }
        Ok(Self {
            soft_success: rules.soft_success.clone(),
            conflicts,
            failure_message: rules.failure_message.clone().unwrap_or(failure_message),
            timeout_message: rules.timeout_message.clone().unwrap_or(timeout_message),
        })
    }

    /// No markers: anything but exit 0 fails with `failure_message`.
    pub fn plain(failure_message: impl Into<String>, timeout_message: impl Into<String>) -> Self {
        Self {
            soft_success: Vec::new(),
            conflicts: Vec::new(),
            failure_message: failure_message.into(),
            timeout_message: timeout_message.into(),
        }
    }

    /// Exit 0 wins; otherwise soft-success markers, then conflict markers,
    /// then the generic failure.
    pub fn classify(&self, output: &CommandOutput) -> Outcome {
        if output.exit_code == Some(0) {
            return Outcome::Success;
        }
        let seen = |needle: &str| output.stdout.contains(needle) || output.stderr.contains(needle);
        if self.soft_success.iter().any(|marker| seen(marker.as_str())) {
            return Outcome::SoftSuccess;
        }
        for (marker, message) in &self.conflicts {
            if marker.found_in(&output.stderr) || marker.found_in(&output.stdout) {
                return Outcome::Conflict(message.clone());
            }
        }
        Outcome::Failed(self.failure_message.clone())
    }

    pub fn timed_out(&self) -> Outcome {
        Outcome::TimedOut(self.timeout_message.clone())
    }

    pub fn failed(&self) -> Outcome {
        Outcome::Failed(self.failure_message.clone())
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs a command, audits it, classifies it.
#[derive(Clone)]
pub struct SideEffectExecutor {
    runner: Arc<dyn CommandRunner>,
    audit: Option<AuditLog>,
    timeout: Duration,
}

impl SideEffectExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, audit: Option<AuditLog>, timeout: Duration) -> Self {
        Self {
            runner,
            audit,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(&self, argv: &[String], classifier: &Classifier) -> Outcome {
        self.execute_with_output(argv, classifier).await.0
    }

    /// [`execute`](Self::execute), also returning what the command printed
    /// when it ran to completion.
    pub async fn execute_with_output(
        &self,
        argv: &[String],
        classifier: &Classifier,
    ) -> (Outcome, Option<CommandOutput>) {
        let result = self.runner.run(argv, self.timeout).await;

        let outcome = match &result {
            Ok(output) => {
                self.audit(argv, output.exit_code, &output.stdout, &output.stderr);
                classifier.classify(output)
            }
            Err(ExecError::TimedOut(after)) => {
                self.audit(argv, None, "", &format!("killed after {:?} timeout", after));
                warn!(program = ?argv.first(), timeout = ?after, "Downstream command timed out");
                classifier.timed_out()
            }
            Err(e) => {
                self.audit(argv, None, "", &e.to_string());
                error!(program = ?argv.first(), error = %e, "Downstream command could not run");
                classifier.failed()
            }
        };

        match &outcome {
            Outcome::Success => info!(program = ?argv.first(), "Downstream command succeeded"),
            Outcome::SoftSuccess => {
                warn!(program = ?argv.first(), "Downstream command exited non-zero but reported success")
            }
            Outcome::Conflict(msg) | Outcome::Failed(msg) => {
                if let Ok(output) = &result {
                    warn!(
                        program = ?argv.first(),
                        exit_code = ?output.exit_code,
                        stderr = %output.stderr.trim(),
                        "Downstream command failed: {}",
                        msg
                    );
                }
            }
            Outcome::TimedOut(_) => {}
        }
        (outcome, result.ok())
    }

    fn audit(&self, argv: &[String], exit_code: Option<i32>, stdout: &str, stderr: &str) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_invocation(argv, exit_code, stdout, stderr) {
                error!(error = %e, "Failed to append to audit log");
            }
        }
    }
}
