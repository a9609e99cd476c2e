use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool sizing, restart backoff and liveness settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers kept alive
    pub desired_workers: usize,
    /// Upper bound for `resize`
    pub max_workers: usize,
    /// Base delay for the first restart of a slot
    pub restart_base_delay_ms: u64,
    /// Backoff cap
    pub restart_max_delay_ms: u64,
    /// A worker that stayed up this long resets its slot's restart counter
    pub restart_reset_after_ms: u64,
    /// Memory above this triggers a warning event (alert only)
    pub memory_limit_bytes: u64,
    /// Interval between health-check probes; silence for twice this kills the worker
    pub health_check_interval_ms: u64,
    /// Time a worker gets to exit on its own after `shutdown`
    pub worker_grace_period_ms: u64,
    /// Buffered messages per direction on each worker channel
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            desired_workers: 4,
            max_workers: 16,
            restart_base_delay_ms: 1_000,
            restart_max_delay_ms: 5_000,
            restart_reset_after_ms: 60_000,
            memory_limit_bytes: 512 * 1024 * 1024,
            health_check_interval_ms: 30_000,
            worker_grace_period_ms: 2_000,
            channel_capacity: 32,
        }
    }
}

impl PoolConfig {
    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_millis(self.restart_base_delay_ms)
    }

    pub fn restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.restart_max_delay_ms)
    }

    pub fn restart_reset_after(&self) -> Duration {
        Duration::from_millis(self.restart_reset_after_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Silence tolerated before a worker is presumed dead
    pub fn unresponsive_after(&self) -> Duration {
        self.health_check_interval() * 2
    }

    pub fn worker_grace_period(&self) -> Duration {
        Duration::from_millis(self.worker_grace_period_ms)
    }
}

/// Component health monitor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    /// Upper bound for a single component `check()`
    pub check_timeout_ms: u64,
    /// Consecutive non-healthy cycles before the threshold event fires
    pub failure_threshold: u32,
    /// Fraction of system memory used by this process considered critical
    pub memory_critical_threshold: f64,
    /// Load per core considered critical
    pub cpu_critical_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            check_timeout_ms: 5_000,
            failure_threshold: 3,
            memory_critical_threshold: 0.85,
            cpu_critical_threshold: 0.9,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// Recovery coordinator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Failed attempts before a component is frozen as failed
    pub max_attempts: u32,
    /// Delay between detection and the attempt
    pub delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5_000,
        }
    }
}

impl RecoveryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Graceful shutdown settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Global deadline for closing every resource
    pub deadline_ms: u64,
    /// Extra time the OS-thread backstop waits past the deadline
    pub backstop_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 10_000,
            backstop_grace_ms: 2_000,
        }
    }
}

impl ShutdownConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn backstop_grace(&self) -> Duration {
        Duration::from_millis(self.backstop_grace_ms)
    }
}

/// How worker processes are launched and how they behave
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable; defaults to the running binary with the `worker` subcommand
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Interval between metrics pushes
    pub metrics_interval_ms: u64,
    /// Upper bound for draining in-flight work after `shutdown`
    pub drain_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            metrics_interval_ms: 10_000,
            drain_timeout_ms: 1_500,
        }
    }
}

impl WorkerConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Directory for the daily rotated log file
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env_name = std::env::var("DEXSUP_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(File::from(config_dir.join(format!("{env_name}.toml"))).required(false))
            // Override with environment variables (DEXSUP__POOL__DESIRED_WORKERS, etc.)
            .add_source(
                Environment::with_prefix("DEXSUP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Pool
        if self.pool.desired_workers == 0 {
            errors.push("pool.desired_workers must be positive".to_string());
        }
        if self.pool.desired_workers > self.pool.max_workers {
            errors.push(format!(
                "pool.desired_workers ({}) exceeds pool.max_workers ({})",
                self.pool.desired_workers, self.pool.max_workers
            ));
        }
        if self.pool.restart_base_delay_ms == 0 {
            errors.push("pool.restart_base_delay_ms must be positive".to_string());
        }
        if self.pool.restart_max_delay_ms < self.pool.restart_base_delay_ms {
            errors.push(
                "pool.restart_max_delay_ms must be at least pool.restart_base_delay_ms".to_string(),
            );
        }
        if self.pool.health_check_interval_ms == 0 {
            errors.push("pool.health_check_interval_ms must be positive".to_string());
        }
        if self.pool.channel_capacity == 0 {
            errors.push("pool.channel_capacity must be positive".to_string());
        }

        // Health
        if self.health.check_interval_ms == 0 {
            errors.push("health.check_interval_ms must be positive".to_string());
        }
        if self.health.check_timeout_ms == 0 {
            errors.push("health.check_timeout_ms must be positive".to_string());
        }
        if self.health.failure_threshold == 0 {
            errors.push("health.failure_threshold must be positive".to_string());
        }
        for (name, value) in [
            ("health.memory_critical_threshold", self.health.memory_critical_threshold),
            ("health.cpu_critical_threshold", self.health.cpu_critical_threshold),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                errors.push(format!("{name} must be a positive number"));
            }
        }
        if self.health.memory_critical_threshold > 1.0 {
            errors.push("health.memory_critical_threshold must not exceed 1.0".to_string());
        }

        // Recovery
        if self.recovery.max_attempts == 0 {
            errors.push("recovery.max_attempts must be positive".to_string());
        }

        // Shutdown
        if self.shutdown.deadline_ms == 0 {
            errors.push("shutdown.deadline_ms must be positive".to_string());
        }
        if self.pool.worker_grace_period_ms >= self.shutdown.deadline_ms {
            errors.push(
                "pool.worker_grace_period_ms should be less than shutdown.deadline_ms".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
