//! Selfserve portal launcher.
//!
//! `serve` runs the HTTP API with its background sweeps; the remaining
//! subcommands are one-shot admin utilities against a single account
//! system's record store.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use selfserve::config::{PortalConfig, DEFAULT_CONFIG_FILE};
use selfserve::portal::{self, Collaborators, Portal};
use selfserve::server;
use selfserve_db::AccountDb;
use selfserve_engine::{reap_once, RequestKind, Shutdown};
use selfserve_logging::{init_logging, LogConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long background tasks get to notice shutdown.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "selfserve", about = "Self-service account portal")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "SELFSERVE_CONFIG", default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API and background sweeps
    Serve,

    /// Run one expiry sweep over pending requests
    Reap {
        /// Account system (e.g. confluence, jira)
        #[arg(long)]
        kind: String,
    },

    /// Refuse new requests naming a project
    Block {
        #[arg(long)]
        kind: String,
        project: String,
    },

    /// Accept requests for a project again
    Unblock {
        #[arg(long)]
        kind: String,
        project: String,
    },

    /// List blocked projects
    Blocked {
        #[arg(long)]
        kind: String,
    },

    /// Mark ids (one per line) as already existing downstream
    ImportKnown {
        #[arg(long)]
        kind: String,
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "selfserve",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: failed to initialize logging: {:?}", err);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = PortalConfig::load(&cli.config)?;
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("selfserve")
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Serve => cmd_serve(config).await,
            Commands::Reap { kind } => cmd_reap(&config, &kind).await,
            Commands::Block { kind, project } => cmd_block(&config, &kind, &project, true).await,
            Commands::Unblock { kind, project } => {
                cmd_block(&config, &kind, &project, false).await
            }
            Commands::Blocked { kind } => cmd_blocked(&config, &kind).await,
            Commands::ImportKnown { kind, file } => cmd_import_known(&config, &kind, &file).await,
        }
    })
}

async fn cmd_serve(config: PortalConfig) -> Result<()> {
    config.ensure_dirs()?;
    let collaborators = Collaborators::from_config(&config);
    let portal = Arc::new(Portal::build(config, collaborators).await?);

    let shutdown = Shutdown::new();
    let background = portal.spawn_background(&shutdown);

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        trigger.trigger();
    });

    let served = server::serve(portal, shutdown.clone()).await;
    shutdown.trigger();

    let drain = join_all(background);
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), drain)
        .await
        .is_err()
    {
        warn!("Background tasks did not stop within {}s", SHUTDOWN_TIMEOUT_SECS);
    }
    served
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ============================================================================
// Admin commands
// ============================================================================

fn find_kind(config: &PortalConfig, name: &str) -> Result<RequestKind> {
    let kinds = config.kinds()?;
    let known: Vec<&str> = kinds.iter().map(|k| k.name.as_str()).collect();
    match kinds.iter().find(|k| k.name == name) {
        Some(kind) => Ok(kind.clone()),
        None => bail!(
            "Unknown account system '{}' (configured: {})",
            name,
            known.join(", ")
        ),
    }
}

async fn open_kind(config: &PortalConfig, name: &str) -> Result<AccountDb> {
    let kind = find_kind(config, name)?;
    config.ensure_dirs()?;
    portal::open_db(config, &kind).await
}

async fn cmd_reap(config: &PortalConfig, kind: &str) -> Result<()> {
    let db = open_kind(config, kind).await?;
    let stats = reap_once(&db, AccountDb::now_secs(), &config.reaper).await?;
    println!(
        "Examined {} pending requests, deleted {}, failed {}",
        stats.examined, stats.deleted, stats.failed
    );
    db.close().await;
    Ok(())
}

async fn cmd_block(config: &PortalConfig, kind: &str, project: &str, block: bool) -> Result<()> {
    let db = open_kind(config, kind).await?;
    let project = project.trim().to_lowercase();
    if block {
        if db.block_scope(&project).await? {
            println!("Blocked {} for {} requests", project, kind);
        } else {
            println!("{} was already blocked", project);
        }
    } else if db.unblock_scope(&project).await? {
        println!("Unblocked {} for {} requests", project, kind);
    } else {
        println!("{} was not blocked", project);
    }
    db.close().await;
    Ok(())
}

async fn cmd_blocked(config: &PortalConfig, kind: &str) -> Result<()> {
    let db = open_kind(config, kind).await?;
    for project in db.list_blocked().await? {
        println!("{}", project);
    }
    db.close().await;
    Ok(())
}

async fn cmd_import_known(config: &PortalConfig, kind: &str, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let db = open_kind(config, kind).await?;
    let inserted = db
        .import_known(text.lines().filter(|l| !l.trim_start().starts_with('#')), AccountDb::now_secs())
        .await?;
    println!("Imported {} new ids into {}", inserted, kind);
    db.close().await;
    Ok(())
}
