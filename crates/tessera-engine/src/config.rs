//! Engine configuration, validation, and error types.
//!
//! [`EngineConfig`] is the input for constructing a
//! [`Server`](crate::server::Server) or a bare
//! [`ThreadDispatcher`](crate::dispatcher::ThreadDispatcher).
//! [`validate()`](EngineConfig::validate) checks it at startup;
//! [`from_env()`](EngineConfig::from_env) overlays operator overrides.

use std::time::Duration;

use thiserror::Error;

/// Environment variable overriding [`EngineConfig::worker_count`].
pub const ENV_DISPATCHER_THREADS: &str = "TESSERA_DISPATCHER_THREADS";
/// Environment variable overriding [`EngineConfig::tick_rate_hz`].
pub const ENV_TICK_RATE: &str = "TESSERA_TICK_RATE";
/// Environment variable overriding [`EngineConfig::stall_warning_ms`].
pub const ENV_STALL_WARNING_MS: &str = "TESSERA_STALL_WARNING_MS";

// ── AssignmentStrategy ─────────────────────────────────────────────

/// Built-in partition placement policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AssignmentStrategy {
    /// Hand partitions to workers in turn; never migrate.
    #[default]
    RoundRobin,
    /// Place on the cheapest worker and rebalance between ticks.
    LeastLoaded,
}

// ── RebalanceConfig ────────────────────────────────────────────────

/// Shape of the between-tick rebalancer.
#[derive(Clone, Debug, PartialEq)]
pub struct RebalanceConfig {
    /// Rebalance while `max_load / min_load` exceeds this. Default: 1.25.
    pub imbalance_ratio: f64,
    /// Upper bound on migrations per tick. Default: 4.
    pub max_migrations: usize,
    /// Skip rebalancing when the observed tick was shorter than this,
    /// since there is nothing worth flattening. Default: 5.
    pub min_tick_ms: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            imbalance_ratio: 1.25,
            max_migrations: 4,
            min_tick_ms: 5,
        }
    }
}

// ── EngineConfig ───────────────────────────────────────────────────

/// Configuration for the tick engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of dispatcher worker threads. `None` = auto-detect
    /// (`available_parallelism / 2`, clamped to `[1, 16]`).
    pub worker_count: Option<usize>,
    /// Fixed tick rate for the background driver. `None` = manual
    /// ticking through [`Server::tick`](crate::server::Server::tick).
    pub tick_rate_hz: Option<f64>,
    /// Placement policy for new partitions.
    pub assignment: AssignmentStrategy,
    /// Between-tick rebalancing settings.
    pub rebalance: RebalanceConfig,
    /// Barrier watchdog period in milliseconds. `None` disables it.
    pub stall_warning_ms: Option<u64>,
    /// Capacity of the cross-thread orchestrator job channel. Default: 256.
    pub job_queue_capacity: usize,
    /// Prefix for engine thread names. Default: `"tessera"`.
    pub thread_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            tick_rate_hz: None,
            assignment: AssignmentStrategy::RoundRobin,
            rebalance: RebalanceConfig::default(),
            stall_warning_ms: None,
            job_queue_capacity: 256,
            thread_name_prefix: "tessera".to_string(),
        }
    }
}

impl EngineConfig {
    /// Resolve the actual worker count, applying auto-detection if `None`.
    ///
    /// Explicit values are clamped to `[1, 256]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) => n.clamp(1, 256),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                (cpus / 2).clamp(1, 16)
            }
        }
    }

    /// The watchdog period, if enabled.
    pub fn stall_warning(&self) -> Option<Duration> {
        self.stall_warning_ms.map(Duration::from_millis)
    }

    /// The period of one tick at `tick_rate_hz`, or `None` for manual
    /// ticking.
    ///
    /// Fails for rates whose period is not a representable [`Duration`].
    pub fn tick_budget(&self) -> Result<Option<Duration>, ConfigError> {
        let Some(hz) = self.tick_rate_hz else {
            return Ok(None);
        };
        if !hz.is_finite() || hz <= 0.0 {
            return Err(ConfigError::InvalidTickRate { value: hz });
        }
        Duration::try_from_secs_f64(1.0 / hz)
            .map(Some)
            .map_err(|_| ConfigError::InvalidTickRate { value: hz })
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tick_budget()?;
        let ratio = self.rebalance.imbalance_ratio;
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(ConfigError::InvalidRebalance {
                reason: format!("imbalance_ratio must be finite and >= 1.0, got {ratio}"),
            });
        }
        if self.job_queue_capacity == 0 {
            return Err(ConfigError::JobQueueZero);
        }
        if self.stall_warning_ms == Some(0) {
            return Err(ConfigError::InvalidStallWarning);
        }
        Ok(())
    }

    /// Overlay the `TESSERA_*` environment overrides onto `self`.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.overlay(|name| std::env::var(name).ok())
    }

    /// [`from_env`](Self::from_env) with an injectable variable lookup.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_DISPATCHER_THREADS) {
            self.worker_count = Some(parse_env(ENV_DISPATCHER_THREADS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TICK_RATE) {
            self.tick_rate_hz = Some(parse_env(ENV_TICK_RATE, &raw)?);
        }
        if let Some(raw) = lookup(ENV_STALL_WARNING_MS) {
            self.stall_warning_ms = Some(parse_env(ENV_STALL_WARNING_MS, &raw)?);
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: raw.to_string(),
    })
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while building an engine from its configuration.
#[derive(Debug, PartialEq, Error)]
pub enum ConfigError {
    /// `tick_rate_hz` is not finite and positive, or so low that one
    /// tick's period overflows a `Duration`.
    #[error("tick_rate_hz must be finite, positive and give a representable period, got {value}")]
    InvalidTickRate {
        /// The invalid value.
        value: f64,
    },
    /// A [`RebalanceConfig`] invariant was violated.
    #[error("invalid rebalance config: {reason}")]
    InvalidRebalance {
        /// Which invariant was violated.
        reason: String,
    },
    /// `job_queue_capacity` is zero.
    #[error("job_queue_capacity must be at least 1")]
    JobQueueZero,
    /// `stall_warning_ms` is zero.
    #[error("stall_warning_ms must be at least 1 when set")]
    InvalidStallWarning,
    /// An environment override could not be parsed.
    #[error("environment variable {name}={value:?} is not valid")]
    InvalidEnv {
        /// The variable name.
        name: &'static str,
        /// Its raw value.
        value: String,
    },
    /// A background thread could not be spawned.
    #[error("thread spawn failed: {reason}")]
    ThreadSpawnFailed {
        /// Which thread failed, and why.
        reason: String,
    },
}
