// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Corral

// Container Configuration
pub const CORRAL_SANDBOX_IMAGE: &str = "CORRAL_SANDBOX_IMAGE";
pub const CORRAL_SANDBOX_NAME_PREFIX: &str = "CORRAL_SANDBOX_NAME_PREFIX";
pub const CORRAL_SANDBOX_MEMORY_MB: &str = "CORRAL_SANDBOX_MEMORY_MB";
pub const CORRAL_SANDBOX_CPU_CORES: &str = "CORRAL_SANDBOX_CPU_CORES";
pub const CORRAL_SANDBOX_WORKDIR: &str = "CORRAL_SANDBOX_WORKDIR";
pub const CORRAL_SANDBOX_COMMAND: &str = "CORRAL_SANDBOX_COMMAND";
pub const CORRAL_SANDBOX_STOP_TIMEOUT_SECS: &str = "CORRAL_SANDBOX_STOP_TIMEOUT_SECS";

// Health Check Configuration
pub const CORRAL_HEALTH_POLL_INTERVAL_MS: &str = "CORRAL_HEALTH_POLL_INTERVAL_MS";
pub const CORRAL_HEALTH_TIMEOUT_SECS: &str = "CORRAL_HEALTH_TIMEOUT_SECS";

// Execution Configuration
pub const CORRAL_EXEC_TIMEOUT_MS: &str = "CORRAL_EXEC_TIMEOUT_MS";
pub const CORRAL_DEBUG_LOG_PREFIX: &str = "CORRAL_DEBUG_LOG_PREFIX";
pub const CORRAL_CONTEXT_WINDOW_TOKENS: &str = "CORRAL_CONTEXT_WINDOW_TOKENS";

// Reconciliation
pub const CORRAL_RECONCILE_INTERVAL_SECS: &str = "CORRAL_RECONCILE_INTERVAL_SECS";

// Persistence
pub const CORRAL_DATABASE_URL: &str = "CORRAL_DATABASE_URL";
