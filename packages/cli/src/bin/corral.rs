use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::sandbox::{RunArgs, SandboxContext};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Corral - per-user Docker sandboxes for coding agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a user's sandbox, creating it if needed
    Run(RunArgs),
    /// Show the lifecycle record and container health for a user
    Status {
        #[arg(long)]
        user: String,
    },
    /// Stop and remove a user's sandbox
    Remove {
        #[arg(long)]
        user: String,
    },
    /// Reconcile persisted records against the container runtime
    Reconcile,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout carries only command output and events
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    let context = SandboxContext::from_env().await?;
    let result = dispatch(&context, command).await;

    // Failed runs still flush their stable-state records before the process exits
    context.shutdown().await;
    result
}

async fn dispatch(context: &SandboxContext, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run(args) => cli::sandbox::run_command(context, args).await,
        Commands::Status { user } => {
            cli::sandbox::status_command(context, &user).await?;
            Ok(0)
        }
        Commands::Remove { user } => {
            cli::sandbox::remove_command(context, &user).await?;
            Ok(0)
        }
        Commands::Reconcile => {
            cli::sandbox::reconcile_command(context).await?;
            Ok(0)
        }
    }
}
