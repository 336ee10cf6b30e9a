use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{self, fake, loadavg, processes, Registry, RegistrationError};
use crate::config::Config;
use crate::context::AgentContext;
use crate::datapoint::DataPoint;
use crate::dispatch::Dispatcher;
use crate::export::health::HealthMetrics;
use crate::process::WatchedProc;

/// Agent orchestrates all components: context, collectors, dispatcher, health.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ctx: Option<Arc<AgentContext>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            ctx: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Starts every collector and returns the unified datapoint stream.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<DataPoint>> {
        // 0. Health server first so health checks respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Shared context.
        let hostname = resolve_hostname(&self.cfg.hostname);
        let ctx = Arc::new(
            AgentContext::new(&hostname, Arc::clone(&self.health))
                .with_default_tags(self.cfg.tags.clone())
                .with_freq(self.cfg.freq)
                .with_collector_stats(self.cfg.collector_stats),
        );
        info!(host = %ctx.hostname(), tags = %ctx.default_tags(), "agent context ready");

        // 2. Collectors.
        let mut registry = build_registry(&self.cfg);
        registry.search(&self.cfg.filter);
        if registry.is_empty() {
            warn!("no collectors registered");
        } else {
            info!(count = registry.len(), collectors = ?registry.names(), "registered collectors");
        }

        // 3. Fan-in queue and its reporter.
        let mut dispatcher = Dispatcher::new(self.cfg.channel_capacity, Arc::clone(&self.health));
        let rx = dispatcher
            .take_receiver()
            .context("dispatcher receiver already taken")?;
        dispatcher.spawn_stats_reporter(self.cfg.stats_interval, self.cancel.child_token());

        // 4. One task per collector.
        self.tasks = registry.start(&ctx, &dispatcher, &self.cancel);
        self.ctx = Some(ctx);

        info!("agent fully started");

        Ok(rx)
    }

    /// Cancels every collector task. In-flight batches are not drained.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "collector task ended abnormally");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    pub fn context(&self) -> Option<&Arc<AgentContext>> {
        self.ctx.as_ref()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }
}

/// Builds the registry from configuration. Bad entries are logged and
/// skipped.
pub fn build_registry(cfg: &Config) -> Registry {
    let mut registry = Registry::new();

    if cfg.fake > 0 {
        registry.register_or_warn(fake::fake(cfg.fake));
    }

    if cfg.loadavg {
        registry.register_or_warn(loadavg::loadavg());
    }

    if !cfg.processes.is_empty() {
        let mut watches = Vec::with_capacity(cfg.processes.len());
        for p in &cfg.processes {
            match WatchedProc::new(&p.name, &p.command, &p.args) {
                Ok(w) => watches.push(w),
                Err(source) => {
                    let e = RegistrationError::BadWatch {
                        name: p.name.clone(),
                        source,
                    };
                    warn!(error = %e, "skipping watch entry");
                }
            }
        }
        if !watches.is_empty() {
            registry.register_or_warn(processes::watch_processes(watches));
        }
    }

    if let Some(dir) = &cfg.collectors_dir {
        for program in collector::init_programs(dir) {
            registry.register_or_warn(program);
        }
    }

    registry
}

/// Configured hostname, else the OS hostname, else "unknown".
fn resolve_hostname(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "reading hostname, using \"unknown\"");
            "unknown".to_string()
        }
    }
}
