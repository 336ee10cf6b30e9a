//! Collector kinds, the registry and task startup.

pub mod fake;
pub mod interval;
pub mod loadavg;
pub mod processes;
pub mod program;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::AgentContext;
use crate::dispatch::{Dispatcher, Emitter};

pub use self::interval::IntervalCollector;
pub use self::program::{init_programs, ProgramCollector};

/// A malformed registration. Logged and skipped; startup continues.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid collector folder name {0:?}")]
    BadFolder(String),

    #[error("reading {}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("duplicate collector name {0:?}")]
    Duplicate(String),

    #[error("invalid argument pattern for watch {name:?}")]
    BadWatch {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// A registered source of datapoints.
///
/// Each variant runs as its own task; the kind is fixed at registration.
pub enum Collector {
    Interval(IntervalCollector),
    Program(ProgramCollector),
}

impl Collector {
    pub fn name(&self) -> &str {
        match self {
            Self::Interval(c) => c.name(),
            Self::Program(c) => c.name(),
        }
    }

    /// Runs until `cancel` fires or the output stream closes.
    pub async fn run(self, ctx: Arc<AgentContext>, out: Emitter, cancel: CancellationToken) {
        match self {
            Self::Interval(c) => c.run(ctx, out, cancel).await,
            Self::Program(c) => c.run(ctx, out, cancel).await,
        }
    }
}

impl From<IntervalCollector> for Collector {
    fn from(c: IntervalCollector) -> Self {
        Self::Interval(c)
    }
}

impl From<ProgramCollector> for Collector {
    fn from(c: ProgramCollector) -> Self {
        Self::Program(c)
    }
}

/// The set of collectors the agent will run. Names are unique.
#[derive(Default)]
pub struct Registry {
    collectors: Vec<Collector>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, c: impl Into<Collector>) -> Result<(), RegistrationError> {
        let c = c.into();
        if self.collectors.iter().any(|e| e.name() == c.name()) {
            return Err(RegistrationError::Duplicate(c.name().to_string()));
        }
        self.collectors.push(c);
        Ok(())
    }

    /// Registers `c`, logging and skipping it on failure.
    pub fn register_or_warn(&mut self, c: impl Into<Collector>) {
        if let Err(e) = self.register(c) {
            warn!(error = %e, "skipping collector registration");
        }
    }

    /// Keeps only collectors whose name contains one of `filters`. An empty
    /// filter list keeps everything.
    pub fn search(&mut self, filters: &[String]) {
        if filters.is_empty() {
            return;
        }
        self.collectors
            .retain(|c| filters.iter().any(|f| c.name().contains(f.as_str())));
    }

    pub fn names(&self) -> Vec<&str> {
        self.collectors.iter().map(Collector::name).collect()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Spawns one task per collector, each writing through its own emitter.
    pub fn start(
        self,
        ctx: &Arc<AgentContext>,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.collectors
            .into_iter()
            .map(|c| {
                info!(collector = %c.name(), "starting collector");
                let out = dispatcher.emitter(c.name());
                tokio::spawn(c.run(Arc::clone(ctx), out, cancel.child_token()))
            })
            .collect()
    }
}
