//! Configuration management for the orchestration core.
//!
//! Configuration can be set via environment variables:
//! - `ORCHESTRATOR_TOKEN_SECRET` - Required. HMAC secret for capability tokens.
//! - `ORCHESTRATOR_MAX_CONCURRENT` - Optional. Global in-flight dispatch ceiling. Defaults to `16`.
//! - `ORCHESTRATOR_EXECUTION_TIMEOUT_SECS` - Optional. Per-execution wall clock. Defaults to `30`.
//! - `ORCHESTRATOR_TOKEN_TTL_SECS` - Optional. Capability token lifetime. Defaults to `300`.
//! - `ORCHESTRATOR_TOKEN_MAX_USES` - Optional. Uses per token. Defaults to `1`.
//! - `ORCHESTRATOR_HEALTH_FAILURE_THRESHOLD` - Optional. Consecutive failed health
//!   checks before an arm is deregistered. Defaults to `3`.
//! - `ORCHESTRATOR_RETRY_BASE_MS` / `ORCHESTRATOR_RETRY_MAX_MS` - Optional. Retry backoff
//!   base and cap. Default to `1000` / `30000`.
//! - `ORCHESTRATOR_RETRY_MULTIPLIER` - Optional. Backoff multiplier. Defaults to `2.0`.
//! - `ORCHESTRATOR_TIMEOUT_GROWTH` - Optional. Wall-clock growth after a timeout. Defaults to `1.5`.
//! - `ORCHESTRATOR_SANDBOX_ROOT` - Optional. Sandbox working root. Defaults to `./sandbox`.
//! - `ORCHESTRATOR_MAX_OUTPUT_BYTES` - Optional. Captured output cap. Defaults to `1048576`.
//! - `ORCHESTRATOR_MAX_MEMORY_BYTES` - Optional. Address-space limit for sandboxed processes.
//! - `ORCHESTRATOR_MAX_CPU_SECS` - Optional. CPU-time limit for sandboxed processes.
//! - `ORCHESTRATOR_STORE` - Optional. `memory`, `file` or `sqlite`. Defaults to `memory`.
//! - `ORCHESTRATOR_STATE_DIR` - Optional. Directory for file/sqlite stores. Defaults to `./state`.
//! - `ORCHESTRATOR_ARM_MANIFEST` - Optional. YAML file declaring HTTP arms.
//! - `ORCHESTRATOR_MIN_CONFIDENCE` - Optional. Minimum validation confidence. Defaults to `0.5`.
//! - `ORCHESTRATOR_MAX_PLAN_STEPS` - Optional. Largest accepted plan. Defaults to `50`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::budget::RetryPolicy;
use crate::sandbox::ResourceLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which durable store backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" | "json" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Working root; file actions cannot escape it
    pub root: PathBuf,

    /// Captured stdout/stderr cap per execution
    pub max_output_bytes: usize,

    /// RLIMIT_AS for spawned processes
    pub max_memory_bytes: Option<u64>,

    /// RLIMIT_CPU for spawned processes
    pub max_cpu_secs: Option<u64>,

    /// PATH handed to spawned processes (the rest of the environment is cleared)
    pub path_env: String,
}

impl SandboxConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            max_output_bytes: 1024 * 1024,
            max_memory_bytes: None,
            max_cpu_secs: None,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret for capability token signatures
    pub token_secret: String,

    /// Global ceiling on in-flight dispatches
    pub max_concurrent_dispatches: usize,

    /// Initial per-execution wall clock
    pub execution_timeout: Duration,

    pub token_ttl: Duration,

    pub token_max_uses: u32,

    /// Consecutive unreachable health checks before deregistration
    pub health_failure_threshold: u32,

    pub retry: RetryPolicy,

    pub sandbox: SandboxConfig,

    pub store: StoreBackend,

    /// Directory for the file and sqlite stores
    pub state_dir: PathBuf,

    /// YAML manifest of HTTP arms to register at startup
    pub arm_manifest: Option<PathBuf>,

    /// Results validated below this confidence are rejected
    pub min_validation_confidence: f64,

    pub max_plan_steps: usize,
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_opt<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingEnvVar` if `ORCHESTRATOR_TOKEN_SECRET` is not set,
    /// and `ConfigError::InvalidValue` for any variable that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token_secret = std::env::var("ORCHESTRATOR_TOKEN_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("ORCHESTRATOR_TOKEN_SECRET".to_string()))?;
        if token_secret.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "ORCHESTRATOR_TOKEN_SECRET".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let max_concurrent_dispatches = env_or("ORCHESTRATOR_MAX_CONCURRENT", 16usize)?;
        if max_concurrent_dispatches == 0 {
            return Err(ConfigError::InvalidValue(
                "ORCHESTRATOR_MAX_CONCURRENT".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let retry = RetryPolicy {
            base_delay: Duration::from_millis(env_or("ORCHESTRATOR_RETRY_BASE_MS", 1000u64)?),
            max_delay: Duration::from_millis(env_or("ORCHESTRATOR_RETRY_MAX_MS", 30_000u64)?),
            multiplier: env_or("ORCHESTRATOR_RETRY_MULTIPLIER", 2.0f64)?,
            timeout_growth: env_or("ORCHESTRATOR_TIMEOUT_GROWTH", 1.5f64)?,
        };

        let sandbox_root = std::env::var("ORCHESTRATOR_SANDBOX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sandbox"));
        let mut sandbox = SandboxConfig::new(sandbox_root);
        sandbox.max_output_bytes = env_or("ORCHESTRATOR_MAX_OUTPUT_BYTES", sandbox.max_output_bytes)?;
        sandbox.max_memory_bytes = env_opt("ORCHESTRATOR_MAX_MEMORY_BYTES")?;
        sandbox.max_cpu_secs = env_opt("ORCHESTRATOR_MAX_CPU_SECS")?;

        let min_validation_confidence = env_or("ORCHESTRATOR_MIN_CONFIDENCE", 0.5f64)?;
        if !(0.0..=1.0).contains(&min_validation_confidence) {
            return Err(ConfigError::InvalidValue(
                "ORCHESTRATOR_MIN_CONFIDENCE".to_string(),
                "must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(Self {
            token_secret,
            max_concurrent_dispatches,
            execution_timeout: Duration::from_secs(env_or("ORCHESTRATOR_EXECUTION_TIMEOUT_SECS", 30u64)?),
            token_ttl: Duration::from_secs(env_or("ORCHESTRATOR_TOKEN_TTL_SECS", 300u64)?),
            token_max_uses: env_or("ORCHESTRATOR_TOKEN_MAX_USES", 1u32)?.max(1),
            health_failure_threshold: env_or("ORCHESTRATOR_HEALTH_FAILURE_THRESHOLD", 3u32)?.max(1),
            retry,
            sandbox,
            store: env_or("ORCHESTRATOR_STORE", StoreBackend::Memory)?,
            state_dir: std::env::var("ORCHESTRATOR_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            arm_manifest: std::env::var("ORCHESTRATOR_ARM_MANIFEST").ok().map(PathBuf::from),
            min_validation_confidence,
            max_plan_steps: env_or("ORCHESTRATOR_MAX_PLAN_STEPS", 50usize)?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(token_secret: impl Into<String>, sandbox_root: PathBuf) -> Self {
        Self {
            token_secret: token_secret.into(),
            max_concurrent_dispatches: 16,
            execution_timeout: Duration::from_secs(30),
            token_ttl: Duration::from_secs(300),
            token_max_uses: 1,
            health_failure_threshold: 3,
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::new(sandbox_root),
            store: StoreBackend::Memory,
            state_dir: PathBuf::from("./state"),
            arm_manifest: None,
            min_validation_confidence: 0.5,
            max_plan_steps: 50,
        }
    }

    /// Limits for a first attempt.
    pub fn default_limits(&self) -> ResourceLimits {
        ResourceLimits {
            wall_clock: self.execution_timeout,
            max_output_bytes: self.sandbox.max_output_bytes,
            max_memory_bytes: self.sandbox.max_memory_bytes,
            max_cpu_secs: self.sandbox.max_cpu_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let config = Config::new("secret", PathBuf::from("/tmp/sandbox"));
        assert_eq!(config.max_concurrent_dispatches, 16);
        assert_eq!(config.token_max_uses, 1);
        assert_eq!(config.default_limits().wall_clock, Duration::from_secs(30));
        assert_eq!(config.default_limits().max_output_bytes, 1024 * 1024);
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("SQLite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert_eq!("file".parse::<StoreBackend>().unwrap(), StoreBackend::File);
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
