// ABOUTME: Runtime settings for sandbox provisioning, health checks and execution
// ABOUTME: Loaded from CORRAL_* environment variables with defaults and validation

use corral_config::{constants, parse_or};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    pub image: String,
    pub name_prefix: String,
    pub memory_mb: u64,
    pub cpu_cores: f32,
    pub working_dir: String,
    /// Keep-alive command the container runs between execs
    pub command: Vec<String>,
    pub stop_timeout_secs: u64,
    pub health_poll_interval: Duration,
    pub health_timeout: Duration,
    /// `None` lets commands run without a deadline
    pub exec_timeout: Option<Duration>,
    pub debug_log_prefix: String,
    pub context_window: u64,
    /// `None` disables the periodic reconciler
    pub reconcile_interval: Option<Duration>,
    pub database_url: Option<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "node:20-bookworm-slim".to_string(),
            name_prefix: "corral".to_string(),
            memory_mb: 2048,
            cpu_cores: 2.0,
            working_dir: "/workspace".to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            stop_timeout_secs: 10,
            health_poll_interval: Duration::from_millis(500),
            health_timeout: Duration::from_secs(60),
            exec_timeout: None,
            debug_log_prefix: "[corral-debug]".to_string(),
            context_window: 200_000,
            reconcile_interval: Some(Duration::from_secs(60)),
            database_url: None,
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(corral_config::env_string)
    }

    /// Build settings from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let command = match get(constants::CORRAL_SANDBOX_COMMAND) {
            Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
            None => defaults.command,
        };

        let poll_ms: u64 = parse_or(
            constants::CORRAL_HEALTH_POLL_INTERVAL_MS,
            get(constants::CORRAL_HEALTH_POLL_INTERVAL_MS).as_deref(),
            defaults.health_poll_interval.as_millis() as u64,
        );
        let health_secs: u64 = parse_or(
            constants::CORRAL_HEALTH_TIMEOUT_SECS,
            get(constants::CORRAL_HEALTH_TIMEOUT_SECS).as_deref(),
            defaults.health_timeout.as_secs(),
        );
        let exec_ms: u64 = parse_or(
            constants::CORRAL_EXEC_TIMEOUT_MS,
            get(constants::CORRAL_EXEC_TIMEOUT_MS).as_deref(),
            0,
        );
        let reconcile_secs: u64 = parse_or(
            constants::CORRAL_RECONCILE_INTERVAL_SECS,
            get(constants::CORRAL_RECONCILE_INTERVAL_SECS).as_deref(),
            defaults.reconcile_interval.map(|d| d.as_secs()).unwrap_or(0),
        );

        let settings = Self {
            image: get(constants::CORRAL_SANDBOX_IMAGE).unwrap_or(defaults.image),
            name_prefix: get(constants::CORRAL_SANDBOX_NAME_PREFIX).unwrap_or(defaults.name_prefix),
            memory_mb: parse_or(
                constants::CORRAL_SANDBOX_MEMORY_MB,
                get(constants::CORRAL_SANDBOX_MEMORY_MB).as_deref(),
                defaults.memory_mb,
            ),
            cpu_cores: parse_or(
                constants::CORRAL_SANDBOX_CPU_CORES,
                get(constants::CORRAL_SANDBOX_CPU_CORES).as_deref(),
                defaults.cpu_cores,
            ),
            working_dir: get(constants::CORRAL_SANDBOX_WORKDIR).unwrap_or(defaults.working_dir),
            command,
            stop_timeout_secs: parse_or(
                constants::CORRAL_SANDBOX_STOP_TIMEOUT_SECS,
                get(constants::CORRAL_SANDBOX_STOP_TIMEOUT_SECS).as_deref(),
                defaults.stop_timeout_secs,
            ),
            health_poll_interval: Duration::from_millis(poll_ms),
            health_timeout: Duration::from_secs(health_secs),
            exec_timeout: (exec_ms > 0).then(|| Duration::from_millis(exec_ms)),
            debug_log_prefix: get(constants::CORRAL_DEBUG_LOG_PREFIX)
                .unwrap_or(defaults.debug_log_prefix),
            context_window: parse_or(
                constants::CORRAL_CONTEXT_WINDOW_TOKENS,
                get(constants::CORRAL_CONTEXT_WINDOW_TOKENS).as_deref(),
                defaults.context_window,
            ),
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
            database_url: get(constants::CORRAL_DATABASE_URL),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(name: &'static str, reason: impl Into<String>) -> SettingsError {
            SettingsError::Invalid {
                name,
                reason: reason.into(),
            }
        }

        if self.image.trim().is_empty() {
            return Err(invalid(constants::CORRAL_SANDBOX_IMAGE, "image must be set"));
        }
        if self.name_prefix.is_empty()
            || !self
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                constants::CORRAL_SANDBOX_NAME_PREFIX,
                format!("{:?} is not a valid container name prefix", self.name_prefix),
            ));
        }
        if self.memory_mb < 64 {
            return Err(invalid(
                constants::CORRAL_SANDBOX_MEMORY_MB,
                "memory must be at least 64 MB",
            ));
        }
        if !(self.cpu_cores > 0.0 && self.cpu_cores <= 64.0) {
            return Err(invalid(
                constants::CORRAL_SANDBOX_CPU_CORES,
                "cpu cores must be within (0, 64]",
            ));
        }
        if self.command.is_empty() {
            return Err(invalid(
                constants::CORRAL_SANDBOX_COMMAND,
                "keep-alive command must not be empty",
            ));
        }
        if self.health_poll_interval.is_zero() {
            return Err(invalid(
                constants::CORRAL_HEALTH_POLL_INTERVAL_MS,
                "poll interval must be positive",
            ));
        }
        if self.health_timeout < self.health_poll_interval {
            return Err(invalid(
                constants::CORRAL_HEALTH_TIMEOUT_SECS,
                "health timeout must be at least one poll interval",
            ));
        }
        if self.context_window == 0 {
            return Err(invalid(
                constants::CORRAL_CONTEXT_WINDOW_TOKENS,
                "context window must be positive",
            ));
        }
        Ok(())
    }
}
