use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use hostcollect::agent::Agent;
use hostcollect::config::Config;
use hostcollect::output::{self, JsonLines};

/// Host telemetry agent writing datapoints as JSON lines on stdout.
#[derive(Parser)]
#[command(name = "hostcollect", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Only run collectors whose name contains one of these substrings.
    #[arg(short, long)]
    filter: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Print the names of the collectors that would run, then exit.
    List,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// Hung external programs or blocking collectors must not hold up exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("hostcollect {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if !cli.filter.is_empty() {
        cfg.filter = cli.filter.clone();
    }

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    // Logs go to stderr; stdout carries datapoints.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if let Some(Command::List) = &cli.command {
        let mut registry = hostcollect::agent::build_registry(&cfg);
        registry.search(&cfg.filter);
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting hostcollect",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = rt.block_on(run(cfg));
    rt.shutdown_timeout(SHUTDOWN_TIMEOUT);

    result
}

async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "installing signal handlers");
        }
        signal_token.cancel();
    });

    let mut agent = Agent::new(cfg)?;
    let mut rx = agent.start().await?;

    let mut out = JsonLines::new(tokio::io::stdout());
    let written = output::drain(&mut rx, &mut out, &shutdown).await;

    agent.stop().await?;

    let written = written.context("writing datapoints to stdout")?;
    tracing::info!(written, "hostcollect stopped");

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for SIGINT")?;
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        tracing::info!("received ctrl-c, shutting down");
    }

    Ok(())
}
