//! Runtime configuration.

use crate::device::{DeviceKind, DeviceSet, DeviceSpec, PlatformGrouping};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Largest device count the cycle LP is built for.
pub const MAX_CYCLE_DEVICES: usize = 16;
/// Longest kernel cycle the LP is built for.
pub const MAX_CYCLE_LENGTH: usize = 64;

/// Granularity search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrategyKind {
    FullSearch,
    #[default]
    Broyden,
    BadBroyden,
    FixedPoint,
    /// Joint LP over a cycle of kernels.
    MkgrLp,
}

impl StrategyKind {
    /// Name accepted by `PARTITA_STRATEGY`.
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::FullSearch => "fullsearch",
            StrategyKind::Broyden => "broyden",
            StrategyKind::BadBroyden => "badbroyden",
            StrategyKind::FixedPoint => "fixedpoint",
            StrategyKind::MkgrLp => "mkgr-lp",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fullsearch" => Ok(StrategyKind::FullSearch),
            "broyden" => Ok(StrategyKind::Broyden),
            "badbroyden" => Ok(StrategyKind::BadBroyden),
            "fixedpoint" => Ok(StrategyKind::FixedPoint),
            "mkgr-lp" | "mkgrlp" => Ok(StrategyKind::MkgrLp),
            other => Err(Error::config(format!("unknown scheduler '{}'", other))),
        }
    }
}

/// Coherence policy of the buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferPolicy {
    /// Restage the whole buffer through the host on every dispatch.
    Simple,
    /// Track exact sub-regions, stage device-to-device copies once.
    #[default]
    Optim,
}

impl FromStr for BufferPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(BufferPolicy::Simple),
            "optim" => Ok(BufferPolicy::Optim),
            other => Err(Error::config(format!("unknown buffer policy '{}'", other))),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub devices: Vec<DeviceSpec>,
    pub grouping: PlatformGrouping,
    pub strategy: StrategyKind,
    pub buffer_policy: BufferPolicy,

    /// Run every kernel on a single device.
    pub no_split: bool,
    /// Dispatches to run at the starting granularity before adapting.
    pub skip_iterations: u32,
    pub start_granularity: Option<Vec<f64>>,
    pub stop_at_best: bool,
    /// Include transfer time in the per-device objective.
    pub comm_aware: bool,
    /// Kernels per cycle, `mkgr-lp` only.
    pub cycle_length: Option<usize>,

    pub tolerance: f64,
    pub stall_limit: u32,
    pub relaxation: f64,
    pub best_patience: u32,
    pub timer_window: usize,
    pub ewma_alpha: f64,
    /// Keep a per-dispatch [`ScheduleTrace`](crate::telemetry::ScheduleTrace).
    pub record_trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceSpec::new(DeviceKind::Cpu, 0),
                DeviceSpec::new(DeviceKind::Gpu, 0),
            ],
            grouping: PlatformGrouping::default(),
            strategy: StrategyKind::default(),
            buffer_policy: BufferPolicy::default(),
            no_split: false,
            skip_iterations: 0,
            start_granularity: None,
            stop_at_best: false,
            comm_aware: true,
            cycle_length: None,
            tolerance: 1e-3,
            stall_limit: 3,
            relaxation: 0.5,
            best_patience: 5,
            timer_window: 16,
            ewma_alpha: 0.3,
            record_trace: false,
        }
    }
}

impl Config {
    /// Start a [`ConfigBuilder`] from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Read `PARTITA_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Missing keys keep their
    /// defaults; the result is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(list) = lookup("PARTITA_DEVICES") {
            config.devices = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<DeviceSpec>().map_err(Error::config))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = lookup("PARTITA_PLATFORM_GROUPING") {
            config.grouping = v.parse().map_err(Error::config)?;
        }
        if let Some(v) = lookup("PARTITA_SCHEDULER") {
            config.strategy = v.parse()?;
        }
        if let Some(v) = lookup("PARTITA_BUFFER_POLICY") {
            config.buffer_policy = v.parse()?;
        }
        if let Some(v) = lookup("PARTITA_NO_SPLIT") {
            config.no_split = parse_bool("PARTITA_NO_SPLIT", &v)?;
        }
        if let Some(v) = lookup("PARTITA_SKIP_ITERATIONS") {
            config.skip_iterations = parse_num("PARTITA_SKIP_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("PARTITA_START_GRANULARITY") {
            let shares = v
                .split(',')
                .map(|s| parse_num::<f64>("PARTITA_START_GRANULARITY", s))
                .collect::<Result<Vec<_>>>()?;
            config.start_granularity = Some(shares);
        }
        if let Some(v) = lookup("PARTITA_STOP_AT_BEST") {
            config.stop_at_best = parse_bool("PARTITA_STOP_AT_BEST", &v)?;
        }
        if let Some(v) = lookup("PARTITA_COMM_AWARE") {
            config.comm_aware = parse_bool("PARTITA_COMM_AWARE", &v)?;
        }
        if let Some(v) = lookup("PARTITA_CYCLE_LENGTH") {
            config.cycle_length = Some(parse_num("PARTITA_CYCLE_LENGTH", &v)?);
        }
        if let Some(v) = lookup("PARTITA_TRACE") {
            config.record_trace = parse_bool("PARTITA_TRACE", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the settings are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::config("device list is empty"));
        }

        if let Some(shares) = &self.start_granularity {
            if shares.len() != self.devices.len() {
                return Err(Error::config(format!(
                    "start granularity has {} entries for {} devices",
                    shares.len(),
                    self.devices.len()
                )));
            }
            if shares.iter().any(|g| !g.is_finite() || *g < 0.0) {
                return Err(Error::config("start granularity entries must be finite and >= 0"));
            }
            let sum: f64 = shares.iter().sum();
            if (sum - 1.0).abs() > 1e-6 {
                return Err(Error::config(format!(
                    "start granularity sums to {}, expected 1",
                    sum
                )));
            }
        }

        if self.relaxation <= 0.0 || self.relaxation > 1.0 {
            return Err(Error::config("relaxation must be in (0, 1]"));
        }
        if self.tolerance <= 0.0 {
            return Err(Error::config("tolerance must be > 0"));
        }
        if self.ewma_alpha <= 0.0 || self.ewma_alpha > 1.0 {
            return Err(Error::config("ewma_alpha must be in (0, 1]"));
        }
        if self.timer_window == 0 {
            return Err(Error::config("timer_window must be > 0"));
        }

        if self.strategy == StrategyKind::MkgrLp {
            let cycle = self
                .cycle_length
                .ok_or_else(|| Error::config("mkgr-lp requires a cycle length"))?;
            if cycle == 0 || cycle > MAX_CYCLE_LENGTH {
                return Err(Error::resource_exhaustion(format!(
                    "cycle length {} outside 1..={}",
                    cycle, MAX_CYCLE_LENGTH
                )));
            }
            if self.devices.len() > MAX_CYCLE_DEVICES {
                return Err(Error::resource_exhaustion(format!(
                    "{} devices exceeds the cycle solver limit of {}",
                    self.devices.len(),
                    MAX_CYCLE_DEVICES
                )));
            }
        }

        Ok(())
    }

    /// Devices described by this configuration.
    pub fn device_set(&self) -> DeviceSet {
        DeviceSet::new(self.devices.clone(), self.grouping)
    }

    /// Number of configured devices.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("{}: expected a boolean, got '{}'", key, other))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| Error::config(format!("{}: {}", key, e)))
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Builder starting from the defaults.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn devices(mut self, devices: Vec<DeviceSpec>) -> Self {
        self.config.devices = devices;
        self
    }

    pub fn grouping(mut self, grouping: PlatformGrouping) -> Self {
        self.config.grouping = grouping;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn buffer_policy(mut self, policy: BufferPolicy) -> Self {
        self.config.buffer_policy = policy;
        self
    }

    pub fn no_split(mut self, no_split: bool) -> Self {
        self.config.no_split = no_split;
        self
    }

    pub fn skip_iterations(mut self, n: u32) -> Self {
        self.config.skip_iterations = n;
        self
    }

    pub fn start_granularity(mut self, shares: Vec<f64>) -> Self {
        self.config.start_granularity = Some(shares);
        self
    }

    pub fn stop_at_best(mut self, stop: bool) -> Self {
        self.config.stop_at_best = stop;
        self
    }

    pub fn comm_aware(mut self, aware: bool) -> Self {
        self.config.comm_aware = aware;
        self
    }

    pub fn cycle_length(mut self, len: usize) -> Self {
        self.config.cycle_length = Some(len);
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.tolerance = tolerance;
        self
    }

    pub fn stall_limit(mut self, limit: u32) -> Self {
        self.config.stall_limit = limit;
        self
    }

    pub fn relaxation(mut self, relaxation: f64) -> Self {
        self.config.relaxation = relaxation;
        self
    }

    pub fn best_patience(mut self, patience: u32) -> Self {
        self.config.best_patience = patience;
        self
    }

    pub fn timer_window(mut self, window: usize) -> Self {
        self.config.timer_window = window;
        self
    }

    pub fn ewma_alpha(mut self, alpha: f64) -> Self {
        self.config.ewma_alpha = alpha;
        self
    }

    pub fn record_trace(mut self, record: bool) -> Self {
        self.config.record_trace = record;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
