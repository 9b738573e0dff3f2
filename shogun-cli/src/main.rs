//! shogund: runs the coordinator for one workspace.
//!
//! Exit codes: 0 on a normal shutdown, 75 when a restart was
//! requested (a supervising launcher interprets 75 as "respawn").

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use shogun::{Coordinator, WatchMode, RESTART_EXIT_CODE};
use shogun_agent::{RoleProviders, ScriptedProvider};
use shogun_core::config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shogund",
    about = "File-mailbox coordinator for the king/shogun/karou/ashigaru hierarchy"
)]
struct Cli {
    /// Workspace root (the directory holding `.shogun/`).
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("shogund: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let workspace = cli.workspace.canonicalize()?;
    let config = Config::load(&workspace)?;

    init_tracing(&config)?;
    tracing::info!(
        workspace = %workspace.display(),
        provider = %config.provider,
        ashigaru_count = config.ashigaru_count,
        "starting coordinator"
    );

    let providers = build_providers(&config)?;
    let mut coordinator =
        Coordinator::start(config, workspace, providers, WatchMode::Auto).await?;

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
            0
        }
        request = coordinator.wait_for_restart() => match request {
            Some(request) => {
                tracing::info!(request_id = %request.id, "restart requested; exiting for respawn");
                RESTART_EXIT_CODE
            }
            None => 0,
        },
    };

    coordinator.shutdown().await;
    Ok(code)
}

/// JSON lines into `logs/server.log`, compact summaries on stderr.
fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let logs_dir = config.base_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("server.log"))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::sync::Mutex::new(log_file)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .try_init()?;
    Ok(())
}

/// Resolve the configured provider name to one instance per role.
///
/// Real LLM providers are wired in by embedding [`Coordinator`] with
/// a `ThreadProvider` implementation; the built-in `scripted`
/// provider exists for smoke runs of the mailbox plumbing.
fn build_providers(config: &Config) -> Result<RoleProviders, Box<dyn std::error::Error>> {
    match config.provider.as_str() {
        "scripted" => Ok(RoleProviders::single(Arc::new(
            ScriptedProvider::with_texts(&[]),
        ))),
        other => Err(format!(
            "unsupported provider '{other}': embed the coordinator with a ThreadProvider \
             implementation, or set provider to \"scripted\" for a smoke run"
        )
        .into()),
    }
}
