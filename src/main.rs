#![forbid(unsafe_code)]

//! `agent-shepherd`: orchestration daemon.
//!
//! Bootstraps configuration, restores persisted state, launches the
//! configured agents, runs the control loop and serves the IPC socket for
//! `agent-shepherd-ctl`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_shepherd::audit::{AuditLogger, JsonlAuditWriter};
use agent_shepherd::config::GlobalConfig;
use agent_shepherd::ipc::{self, server, IpcState};
use agent_shepherd::orchestrator::auto_assign::AutoAssignService;
use agent_shepherd::orchestrator::continuation::ContinuationDetector;
use agent_shepherd::orchestrator::patterns::PatternCatalog;
use agent_shepherd::orchestrator::scheduler::{spawn_tick_loop, Scheduler};
use agent_shepherd::orchestrator::supervisor::{Supervisor, SupervisorParts};
use agent_shepherd::orchestrator::validator::TaskOutputValidator;
use agent_shepherd::{backend, persistence, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-shepherd", about = "Autonomous agent session orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Keep state in memory only; nothing is written under `state_dir`
    /// except the journal and IPC token.
    #[arg(long)]
    ephemeral: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-shepherd bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    std::fs::create_dir_all(&config.state_dir).map_err(|err| {
        AppError::Config(format!(
            "cannot create state_dir {}: {err}",
            config.state_dir.display()
        ))
    })?;
    info!(state_dir = %config.state_dir.display(), backend = ?config.backend, "configuration loaded");

    // ── Build components ────────────────────────────────
    let store = persistence::open(&config, args.ephemeral);
    let backend = backend::from_config(&config).await?;
    let journal: Arc<dyn AuditLogger> = Arc::new(JsonlAuditWriter::new(config.journal_dir())?);
    let catalog = Arc::new(PatternCatalog::builtin()?);

    let assign = Arc::new(AutoAssignService::new(
        Arc::clone(&store),
        config.validation.max_retries,
    ));
    let validator = Arc::new(TaskOutputValidator::new(
        Arc::clone(&assign),
        config.validation.max_output_bytes,
    ));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&backend)));
    let supervisor = Arc::new(Supervisor::new(
        SupervisorParts {
            backend: Arc::clone(&backend),
            assign: Arc::clone(&assign),
            validator,
            detector: ContinuationDetector::new(catalog),
            journal,
        },
        config.detection.clone(),
    ));

    // ── Restore persisted state ─────────────────────────
    assign.load().await?;
    scheduler.load().await?;

    // ── Launch configured agents ────────────────────────
    supervisor.start_agents(&config.agents, &config.spawn).await?;

    // ── Start control loop and IPC ──────────────────────
    let ct = CancellationToken::new();
    let loop_handle = spawn_tick_loop(
        Arc::clone(&scheduler),
        Arc::clone(&supervisor),
        Duration::from_secs(config.scheduler.tick_seconds),
        ct.clone(),
    );

    let auth_token = ipc::write_auth_token(&config.ipc_token_path())?;
    let ipc_state = Arc::new(IpcState {
        ipc_name: config.ipc_name.clone(),
        backend,
        assign,
        scheduler,
        supervisor: Arc::clone(&supervisor),
        auth_token: Some(auth_token),
    });
    let ipc_handle = server::spawn_ipc_server(ipc_state, ct.clone())?;

    info!("agent-shepherd ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(loop_handle, ipc_handle);
    supervisor.shutdown().await;
    if let Err(err) = std::fs::remove_file(config.ipc_token_path()) {
        warn!(%err, "failed to remove ipc token file");
    }
    info!("agent-shepherd shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
