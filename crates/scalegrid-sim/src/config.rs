//! Advisor configuration (`scalegrid.toml`).
//!
//! ```toml
//! max_parallel_simulations = 8
//! poll_interval = "20ms"
//! simulation_timeout = "5s"
//! resync_interval = "50ms"
//! result_channel_capacity = 16
//! rng_seed = 42
//!
//! [weights.default]
//! cpu = 1.0
//! memory = 0.125
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use scalegrid_placement::WeightTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Upper bound on schedulers running at once.
    pub max_parallel_simulations: usize,
    pub poll_interval: String,
    pub simulation_timeout: String,
    pub resync_interval: String,
    /// Where per-request trace logs go. Defaults to the system temp dir.
    pub trace_dir: Option<PathBuf>,
    pub result_channel_capacity: usize,
    /// Fixed seed for tie-breaking; random when unset.
    pub rng_seed: Option<u64>,
    pub weights: WeightTable,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            max_parallel_simulations: 8,
            poll_interval: "20ms".to_string(),
            simulation_timeout: "5s".to_string(),
            resync_interval: "50ms".to_string(),
            trace_dir: None,
            result_channel_capacity: 16,
            rng_seed: None,
            weights: WeightTable::default(),
        }
    }
}

impl AdvisorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AdvisorConfig = toml::from_str(content)?;
        config.settings()?;
        Ok(config)
    }

    /// Validated runtime settings.
    pub fn settings(&self) -> anyhow::Result<SimulationSettings> {
        if self.result_channel_capacity == 0 {
            bail!("result_channel_capacity must be at least 1");
        }
        Ok(SimulationSettings {
            max_parallel: self.max_parallel_simulations.max(1),
            poll_interval: parse_duration(&self.poll_interval).context("poll_interval")?,
            simulation_timeout: parse_duration(&self.simulation_timeout)
                .context("simulation_timeout")?,
            resync_interval: parse_duration(&self.resync_interval).context("resync_interval")?,
            trace_dir: self.trace_dir.clone().unwrap_or_else(std::env::temp_dir),
            rng_seed: self.rng_seed,
        })
    }
}

/// Parsed form of [`AdvisorConfig`] used by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    pub max_parallel: usize,
    pub poll_interval: Duration,
    pub simulation_timeout: Duration,
    pub resync_interval: Duration,
    pub trace_dir: PathBuf,
    pub rng_seed: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            poll_interval: Duration::from_millis(20),
            simulation_timeout: Duration::from_secs(5),
            resync_interval: Duration::from_millis(50),
            trace_dir: std::env::temp_dir(),
            rng_seed: None,
        }
    }
}

/// Parse `"250ms"`, `"5s"` or `"2m"`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, millis_per_unit) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else {
        bail!("duration {s:?} has no unit (expected ms, s or m)");
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    if value == 0 {
        bail!("duration {s:?} must be positive");
    }
    let millis = value
        .checked_mul(millis_per_unit)
        .with_context(|| format!("duration {s:?} is too large"))?;
    Ok(Duration::from_millis(millis))
}
