// ABOUTME: CLI commands for running, inspecting and removing per-user sandboxes
// ABOUTME: Wires Docker, record storage and the stream executor from environment settings

use super::utils::{exit_code, parse_env_pair};
use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use corral_sandbox::{
    DockerProvider, HealthInfo, HealthMonitor, ManagerError, OutboundEvent, Provider,
    ProviderError, RunOutcome, RunRequest, SandboxManager, SandboxRecord, SandboxSettings,
    SandboxStorage, SessionTable, StreamExecutor,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// User whose sandbox runs the command
    #[arg(long)]
    pub user: String,

    /// Session id (default: random)
    #[arg(long)]
    pub session: Option<String>,

    /// Agent session id the caller already knows
    #[arg(long)]
    pub resume: Option<String>,

    /// Timeout in milliseconds (0 = no timeout)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Working directory inside the sandbox
    #[arg(long)]
    pub cwd: Option<String>,

    /// Environment variable for the command (KEY=VALUE, repeatable)
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Print raw stdout instead of translated protocol events
    #[arg(long)]
    pub raw: bool,

    /// Command and arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

pub struct SandboxContext {
    provider: Arc<DockerProvider>,
    manager: Arc<SandboxManager>,
    executor: StreamExecutor,
    background: Vec<JoinHandle<()>>,
}

impl SandboxContext {
    pub async fn from_env() -> Result<Self> {
        let settings = SandboxSettings::from_env().context("Invalid sandbox settings")?;

        let provider = Arc::new(DockerProvider::new().context("Failed to connect to Docker")?);
        if !provider.is_available().await? {
            anyhow::bail!("Docker daemon is not reachable");
        }

        let health = Arc::new(HealthMonitor::with_poll_interval(
            provider.clone(),
            settings.health_poll_interval,
        ));
        let mut manager = SandboxManager::new(provider.clone(), health, settings.clone());
        if let Some(url) = &settings.database_url {
            let storage = SandboxStorage::connect(url)
                .await
                .with_context(|| format!("Failed to open sandbox database {}", url))?;
            manager = manager.with_storage(Arc::new(storage));
        }
        let manager = Arc::new(manager);

        let mut background = Vec::new();
        background.extend(manager.start_persistence());
        let restored = manager.restore().await?;
        if restored > 0 {
            info!("Loaded {} sandbox records", restored);
        }

        let executor = StreamExecutor::new(manager.clone(), Arc::new(SessionTable::new()));
        Ok(Self {
            provider,
            manager,
            executor,
            background,
        })
    }

    /// Flush records and stop background tasks
    pub async fn shutdown(self) {
        self.manager.persist_all().await;
        for task in self.background {
            task.abort();
        }
    }
}

pub async fn run_command(context: &SandboxContext, args: RunArgs) -> Result<i32> {
    let session_id = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let request = RunRequest {
        session_id: session_id.clone(),
        user_id: args.user,
        command: args.command,
        working_dir: args.cwd,
        env_vars: args.env.into_iter().collect(),
        timeout: args.timeout_ms.map(Duration::from_millis),
    };

    let sessions = context.executor.sessions().clone();
    let abort_id = session_id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting session {}", abort_id);
            sessions.abort(&abort_id).await;
        }
    });
    let reconciler = context
        .manager
        .settings()
        .reconcile_interval
        .map(|interval| context.manager.start_reconcile_task(interval));

    let result = if args.raw {
        run_raw(context, request).await
    } else {
        run_events(context, request, args.resume).await
    };

    interrupt.abort();
    if let Some(reconciler) = reconciler {
        reconciler.abort();
    }

    let outcome = result?;
    if outcome.aborted {
        eprintln!("{} Session {} aborted", "!".yellow().bold(), session_id);
    }
    Ok(exit_code(&outcome))
}

async fn run_raw(context: &SandboxContext, request: RunRequest) -> Result<RunOutcome> {
    let (tx, mut rx) = mpsc::unbounded_channel::<bytes::Bytes>();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = rx.recv().await {
            if stdout.write_all(&chunk).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let result = context.executor.run(request, &tx).await;
    drop(tx);
    if let Err(e) = printer.await {
        warn!("Output printer stopped: {}", e);
    }

    let outcome = result?;
    if !outcome.stderr.is_empty() {
        eprint!("{}", outcome.stderr);
    }
    Ok(outcome)
}

async fn run_events(
    context: &SandboxContext,
    request: RunRequest,
    resume: Option<String>,
) -> Result<RunOutcome> {
    let (mut tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not serialize event: {}", e),
            }
        }
    });

    let result = context
        .executor
        .run_translated(request, &mut tx, resume)
        .await;
    drop(tx);
    if let Err(e) = printer.await {
        warn!("Event printer stopped: {}", e);
    }

    Ok(result?)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    user_id: String,
    sandbox_name: String,
    record: Option<SandboxRecord>,
    health: HealthInfo,
}

pub async fn status_command(context: &SandboxContext, user: &str) -> Result<()> {
    let sandbox_name = context.manager.sandbox_name_for(user)?;
    let report = StatusReport {
        user_id: user.to_string(),
        record: context.manager.get_record(user).await,
        health: context.manager.health().get_health_info(&sandbox_name).await,
        sandbox_name,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn remove_command(context: &SandboxContext, user: &str) -> Result<()> {
    match context.manager.remove_sandbox(user).await {
        Ok(()) => {}
        Err(ManagerError::NotFound(_)) => {
            // No record; the container may still exist from an earlier run
            let name = context.manager.sandbox_name_for(user)?;
            match context.provider.remove_container(&name, true).await {
                Ok(()) => info!("Removed untracked container {}", name),
                Err(ProviderError::NotFound(_)) => {
                    println!("No sandbox found for {}", user);
                    return Ok(());
                }
                Err(e) => return Err(e).context("Failed to remove container"),
            }
        }
        Err(e) => return Err(e.into()),
    }

    println!("{} Removed sandbox for {}", "✓".green(), user);
    Ok(())
}

pub async fn reconcile_command(context: &SandboxContext) -> Result<()> {
    let report = context.manager.reconcile_all().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
