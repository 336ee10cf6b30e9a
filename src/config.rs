use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::datapoint::{valid_tag, TagSet};

/// Top-level configuration for the hostcollect agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Overrides the OS hostname used for the `host` tag.
    #[serde(default)]
    pub hostname: String,

    /// Tags merged into every datapoint. Call-site tags take precedence.
    #[serde(default)]
    pub tags: TagSet,

    /// Default collector interval. Default: 15s.
    #[serde(default = "default_freq", with = "humantime_serde")]
    pub freq: Duration,

    /// Directory of external programs, one numeric sub-folder per interval.
    #[serde(default)]
    pub collectors_dir: Option<PathBuf>,

    /// Only run collectors whose name contains one of these substrings.
    #[serde(default)]
    pub filter: Vec<String>,

    /// Processes to watch.
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,

    /// Number of synthetic `test.fake` points per second. 0 disables.
    #[serde(default)]
    pub fake: usize,

    /// Enable the `/proc/loadavg` collector. Default: true.
    #[serde(default = "default_true")]
    pub loadavg: bool,

    /// Emit per-collector duration and error points.
    #[serde(default)]
    pub collector_stats: bool,

    /// Capacity of the fan-in queue. Default: 10000.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How often per-collector emission tallies are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// One watch list entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Value of the `name` tag on reported metrics.
    pub name: String,

    /// Substring matched against the executable path.
    pub command: String,

    /// Regex matched against the joined arguments. Default: match anything.
    #[serde(default)]
    pub args: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address, e.g. ":9090". Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_freq() -> Duration {
    Duration::from_secs(15)
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hostname: String::new(),
            tags: TagSet::new(),
            freq: default_freq(),
            collectors_dir: None,
            filter: Vec::new(),
            processes: Vec::new(),
            fake: 0,
            loadavg: default_true(),
            collector_stats: false,
            channel_capacity: default_channel_capacity(),
            stats_interval: default_stats_interval(),
            health: HealthConfig::default(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.freq.is_zero() {
            bail!("freq must be positive");
        }

        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if !self.hostname.is_empty() && !valid_tag(&self.hostname) {
            bail!("hostname {:?} contains invalid characters", self.hostname);
        }

        for (k, v) in self.tags.iter() {
            if !valid_tag(k) || !valid_tag(v) {
                bail!("invalid default tag {k}={v}");
            }
        }

        for (i, p) in self.processes.iter().enumerate() {
            if p.name.is_empty() {
                bail!("processes[{i}].name is required");
            }
            if p.command.is_empty() {
                bail!("processes[{i}].command is required");
            }
            regex::Regex::new(&p.args)
                .with_context(|| format!("processes[{i}].args is not a valid regex"))?;
        }

        Ok(())
    }
}
