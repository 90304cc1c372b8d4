//! Shared logging utilities for the selfserve binaries.
//!
//! Two sinks live here: the tracing subscriber, which writes to stderr and
//! to a size-capped [`LogSink`], and the [`AuditLog`], an append-only
//! plain-text trail of every downstream command the portal runs.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "selfserve=info,selfserve_engine=info,selfserve_db=info";
/// Generations kept per sink, the live file included.
const KEEP_GENERATIONS: usize = 5;
const GENERATION_SIZE: u64 = 10 * 1024 * 1024;
const AUDIT_SEPARATOR: &str = "------------------------------------------------------------";

/// Logging configuration shared by the selfserve binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Overrides `$SELFSERVE_HOME/logs`.
    pub log_dir: Option<&'a Path>,
}

/// Install the global subscriber: `<app_name>.log` in the log directory,
/// plus stderr (debug level when verbose).
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.log_dir {
        Some(dir) => dir.to_path_buf(),
        None => logs_dir(),
    };
    let sink = LogSink::open(&log_dir, config.app_name)
        .with_context(|| format!("Failed to open log sink in {}", log_dir.display()))?;

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(sink)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// `$SELFSERVE_HOME`, else `~/.selfserve`.
pub fn selfserve_home() -> PathBuf {
    match std::env::var_os("SELFSERVE_HOME") {
        Some(home) => PathBuf::from(home),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".selfserve"),
    }
}

pub fn logs_dir() -> PathBuf {
    selfserve_home().join("logs")
}

// ============================================================================
// Audit log
// ============================================================================

/// Append-only record of downstream command invocations.
///
/// Each entry carries the argument vector, exit code and both output
/// streams, followed by a separator line. The file is never rotated or
/// truncated.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl AuditLog {
    /// Open (or create) `<dir>/<name>.log`.
    pub fn open(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;
        let path = dir.join(format!("{}.log", file_stem(name)));
        let (file, _) = append_to(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one invocation record.
    pub fn record_invocation(
        &self,
        argv: &[String],
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> io::Result<()> {
        let code = exit_code.map_or_else(|| "none (terminated)".to_string(), |c| c.to_string());
        let entry = format!(
            "[{}] Ran command with arguments: {:?}\nReturn code: {}\nstdout:\n{}\nstderr:\n{}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            argv,
            code,
            stdout,
            stderr,
            AUDIT_SEPARATOR,
        );
        // One lock for the whole entry so concurrent records never interleave.
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(entry.as_bytes())?;
        file.flush()
    }
}

// ============================================================================
// Size-capped files
// ============================================================================

/// Cloneable handle to a size-capped log file. Implements [`MakeWriter`].
#[derive(Clone)]
pub struct LogSink {
    file: Arc<Mutex<GenerationalFile>>,
}

impl LogSink {
    pub fn open(dir: &Path, name: &str) -> io::Result<Self> {
        Self::with_limits(dir, name, KEEP_GENERATIONS, GENERATION_SIZE)
    }

    fn with_limits(dir: &Path, name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        let file = GenerationalFile::open(dir, name, keep, limit)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// A panicking writer must not silence logging for everyone else.
    fn lock(&self) -> MutexGuard<'_, GenerationalFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkGuard(self.lock())
    }
}

/// Exclusive access to a [`LogSink`] for the duration of one event.
pub struct SinkGuard<'a>(MutexGuard<'a, GenerationalFile>);

impl Write for SinkGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// `<name>.log` plus older generations `<name>.log.1` (newest) to
/// `<name>.log.<keep-1>`.
pub struct GenerationalFile {
    live: PathBuf,
    keep: usize,
    limit: u64,
    written: u64,
    handle: File,
}

impl GenerationalFile {
    fn open(dir: &Path, name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let live = dir.join(format!("{}.log", file_stem(name)));
        let (handle, written) = append_to(&live)?;
        let mut file = Self {
            live,
            keep: keep.max(1),
            limit,
            written,
            handle,
        };
        if file.written >= file.limit {
            file.shift_generations()?;
        }
        Ok(file)
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.live.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Drop the oldest generation, move each one up, start a fresh live file.
    fn shift_generations(&mut self) -> io::Result<()> {
        self.handle.flush()?;
        if self.keep > 1 {
            for n in (1..self.keep).rev() {
                let from = if n == 1 {
                    self.live.clone()
                } else {
                    self.generation(n - 1)
                };
                match fs::rename(&from, self.generation(n)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        } else {
            fs::remove_file(&self.live).or_else(|e| match e.kind() {
                io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })?;
        }
        let (handle, written) = append_to(&self.live)?;
        self.handle = handle;
        self.written = written;
        Ok(())
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn append_to(path: &Path) -> io::Result<(File, u64)> {
    let handle = OpenOptions::new().create(true).append(true).open(path)?;
    let len = handle.metadata()?.len();
    Ok((handle, len))
}

impl Write for GenerationalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.shift_generations()?;
        }
        let n = self.handle.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unsafe_name_characters_are_replaced() {
        let tmp = TempDir::new().unwrap();
        let audit = AuditLog::open(tmp.path(), "acli/confluence audit").unwrap();
        assert_eq!(audit.path(), tmp.path().join("acli_confluence_audit.log"));

        let sink = LogSink::open(tmp.path(), "self serve").unwrap();
        assert_eq!(sink.lock().live, tmp.path().join("self_serve.log"));
    }

    #[test]
    fn audit_log_appends_entries() {
        let tmp = TempDir::new().unwrap();
        let audit = AuditLog::open(tmp.path(), "acli").unwrap();

        let argv = vec!["acli.sh".to_string(), "--action".to_string(), "addUser".to_string()];
        audit.record_invocation(&argv, Some(0), "ok", "").unwrap();
        audit.record_invocation(&argv, None, "", "killed").unwrap();

        let content = fs::read_to_string(tmp.path().join("acli.log")).unwrap();
        assert_eq!(content.matches("Ran command with arguments").count(), 2);
        assert!(content.contains("Return code: 0"));
        assert!(content.contains("Return code: none (terminated)"));
        assert!(content.contains("addUser"));
        assert_eq!(content.matches(AUDIT_SEPARATOR).count(), 2);
    }

    #[test]
    fn generations_shift_and_oldest_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let sink = LogSink::with_limits(tmp.path(), "small", 3, 16).unwrap();

        for chunk in [b"aaaaaaaaaa", b"bbbbbbbbbb", b"cccccccccc", b"dddddddddd"] {
            sink.lock().write_all(chunk).unwrap();
        }

        let read = |p: PathBuf| fs::read_to_string(p).unwrap();
        assert_eq!(read(tmp.path().join("small.log")), "dddddddddd");
        assert_eq!(read(tmp.path().join("small.log.1")), "cccccccccc");
        assert_eq!(read(tmp.path().join("small.log.2")), "bbbbbbbbbb");
        assert!(!tmp.path().join("small.log.3").exists());
    }

    #[test]
    fn audit_log_keeps_every_record() {
        let tmp = TempDir::new().unwrap();
        let audit = AuditLog::open(tmp.path(), "acli").unwrap();
        let noisy = "x".repeat(64 * 1024);

        for i in 0..200 {
            let argv = vec!["acli.sh".to_string(), format!("user{}", i)];
            audit.record_invocation(&argv, Some(1), &noisy, "").unwrap();
        }

        let content = fs::read_to_string(audit.path()).unwrap();
        assert_eq!(content.matches(AUDIT_SEPARATOR).count(), 200);
        assert!(content.contains("\"user0\""));
        assert!(content.contains("\"user199\""));
        assert!(!tmp.path().join("acli.log.1").exists());
    }

    #[test]
    fn sink_is_a_tracing_writer() {
        let tmp = TempDir::new().unwrap();
        let sink = LogSink::open(tmp.path(), "portal").unwrap();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(kind = "jira", "reaper pass finished");
        });

        let content = fs::read_to_string(tmp.path().join("portal.log")).unwrap();
        assert!(content.contains("reaper pass finished"));
        assert!(content.contains("kind=\"jira\""));
    }

    #[test]
    fn reopening_appends() {
        let tmp = TempDir::new().unwrap();
        {
            let audit = AuditLog::open(tmp.path(), "acli").unwrap();
            audit.record_invocation(&["a".to_string()], Some(1), "", "").unwrap();
        }
        let audit = AuditLog::open(tmp.path(), "acli").unwrap();
        audit.record_invocation(&["b".to_string()], Some(0), "", "").unwrap();
        let content = fs::read_to_string(audit.path()).unwrap();
        assert_eq!(content.matches(AUDIT_SEPARATOR).count(), 2);
    }
}
