// ABOUTME: Readiness and liveness checks for sandbox containers
// ABOUTME: Polls runtime inspect until ready and keeps recent health observations

use crate::providers::{ContainerInspect, ContainerStatus, HealthcheckStatus, Provider};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observations kept per sandbox
const MAX_CHECKS_PER_SANDBOX: usize = 100;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthError {
    #[error("Sandbox {sandbox_id} not ready after {timeout:?}")]
    Timeout {
        sandbox_id: String,
        timeout: Duration,
    },

    #[error("Sandbox {sandbox_id} reported unhealthy: {reason}")]
    Unhealthy { sandbox_id: String, reason: String },

    #[error("Sandbox {sandbox_id} is no longer running ({status:?})")]
    Exited {
        sandbox_id: String,
        status: RuntimeStatus,
    },
}

pub type Result<T> = std::result::Result<T, HealthError>;

/// Coarse liveness of a container as seen by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    Exited,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unhealthy,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub sandbox_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub runtime_status: RuntimeStatus,
    pub response_time_ms: u64,
}

/// Point-in-time health projection of one sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthInfo {
    pub sandbox_id: String,
    pub runtime_status: RuntimeStatus,
    pub has_healthcheck: bool,
    pub healthcheck: Option<String>,
    pub last_healthcheck_output: Option<String>,
    pub healthy: bool,
}

/// Outcome of a single readiness observation
enum Readiness {
    Ready,
    Pending,
    Failed(HealthError),
}

pub struct HealthMonitor {
    provider: Arc<dyn Provider>,
    poll_interval: Duration,
    checks: RwLock<HashMap<String, Vec<HealthCheck>>>,
}

impl HealthMonitor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::with_poll_interval(provider, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(provider: Arc<dyn Provider>, poll_interval: Duration) -> Self {
        Self {
            provider,
            poll_interval,
            checks: RwLock::new(HashMap::new()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn runtime_status(inspect: &ContainerInspect) -> RuntimeStatus {
        match inspect.status {
            ContainerStatus::Running | ContainerStatus::Restarting => RuntimeStatus::Running,
            _ => RuntimeStatus::Exited,
        }
    }

    async fn inspect(&self, sandbox_id: &str) -> Option<ContainerInspect> {
        match self.provider.inspect_container(sandbox_id).await {
            Ok(inspect) => Some(inspect),
            Err(e) => {
                debug!("Inspect of {} failed, treating as removed: {}", sandbox_id, e);
                None
            }
        }
    }

    /// Liveness of a container. Inspect failures of any kind read as `Removed`.
    pub async fn get_status(&self, sandbox_id: &str) -> RuntimeStatus {
        match self.inspect(sandbox_id).await {
            Some(inspect) => Self::runtime_status(&inspect),
            None => RuntimeStatus::Removed,
        }
    }

    fn classify(sandbox_id: &str, inspect: Option<&ContainerInspect>) -> Readiness {
        let Some(inspect) = inspect else {
            return Readiness::Failed(HealthError::Exited {
                sandbox_id: sandbox_id.to_string(),
                status: RuntimeStatus::Removed,
            });
        };

        match inspect.status {
            ContainerStatus::Running => {}
            ContainerStatus::Created | ContainerStatus::Restarting => return Readiness::Pending,
            _ => {
                return Readiness::Failed(HealthError::Exited {
                    sandbox_id: sandbox_id.to_string(),
                    status: RuntimeStatus::Exited,
                })
            }
        }

        if !inspect.has_healthcheck {
            return Readiness::Ready;
        }

        match inspect.health {
            Some(HealthcheckStatus::Healthy) => Readiness::Ready,
            Some(HealthcheckStatus::Unhealthy) => Readiness::Failed(HealthError::Unhealthy {
                sandbox_id: sandbox_id.to_string(),
                reason: inspect
                    .health_log
                    .clone()
                    .unwrap_or_else(|| "healthcheck failed".to_string()),
            }),
            Some(HealthcheckStatus::Starting) | None => Readiness::Pending,
        }
    }

    /// Poll until the container is running and, if it defines a healthcheck,
    /// reports healthy. Unhealthy or exited containers fail immediately.
    pub async fn wait_until_ready(&self, sandbox_id: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        info!(
            "Waiting for sandbox {} to become ready (timeout: {:?})",
            sandbox_id, timeout
        );

        loop {
            let started = Instant::now();
            let inspect = self.inspect(sandbox_id).await;
            let readiness = Self::classify(sandbox_id, inspect.as_ref());
            self.record_check(sandbox_id, inspect.as_ref(), &readiness, started.elapsed())
                .await;

            match readiness {
                Readiness::Ready => {
                    debug!("Sandbox {} is ready", sandbox_id);
                    return Ok(());
                }
                Readiness::Failed(e) => {
                    warn!("Sandbox {} failed readiness: {}", sandbox_id, e);
                    return Err(e);
                }
                Readiness::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HealthError::Timeout {
                    sandbox_id: sandbox_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn is_healthy(&self, sandbox_id: &str) -> bool {
        self.get_health_info(sandbox_id).await.healthy
    }

    pub async fn get_health_info(&self, sandbox_id: &str) -> HealthInfo {
        let started = Instant::now();
        let inspect = self.inspect(sandbox_id).await;
        let readiness = Self::classify(sandbox_id, inspect.as_ref());
        // Unknown ids get no history; a tracked sandbox that vanished is recorded as down
        if inspect.is_some() || self.checks.read().await.contains_key(sandbox_id) {
            self.record_check(sandbox_id, inspect.as_ref(), &readiness, started.elapsed())
                .await;
        }

        HealthInfo {
            sandbox_id: sandbox_id.to_string(),
            runtime_status: inspect
                .as_ref()
                .map(Self::runtime_status)
                .unwrap_or(RuntimeStatus::Removed),
            has_healthcheck: inspect.as_ref().is_some_and(|i| i.has_healthcheck),
            healthcheck: inspect
                .as_ref()
                .and_then(|i| i.health)
                .map(|p| format!("{:?}", p).to_lowercase()),
            last_healthcheck_output: inspect.and_then(|i| i.health_log),
            healthy: matches!(readiness, Readiness::Ready),
        }
    }

    async fn record_check(
        &self,
        sandbox_id: &str,
        inspect: Option<&ContainerInspect>,
        readiness: &Readiness,
        elapsed: Duration,
    ) {
        let (status, message) = match readiness {
            Readiness::Ready => (HealthStatus::Healthy, None),
            Readiness::Pending => (HealthStatus::Starting, None),
            Readiness::Failed(HealthError::Unhealthy { reason, .. }) => {
                (HealthStatus::Unhealthy, Some(reason.clone()))
            }
            Readiness::Failed(e) => (HealthStatus::Down, Some(e.to_string())),
        };

        let check = HealthCheck {
            sandbox_id: sandbox_id.to_string(),
            timestamp: Utc::now(),
            status,
            message,
            runtime_status: inspect
                .map(Self::runtime_status)
                .unwrap_or(RuntimeStatus::Removed),
            response_time_ms: elapsed.as_millis() as u64,
        };

        let mut checks = self.checks.write().await;
        let sandbox_checks = checks.entry(sandbox_id.to_string()).or_default();
        sandbox_checks.push(check);
        if sandbox_checks.len() > MAX_CHECKS_PER_SANDBOX {
            let excess = sandbox_checks.len() - MAX_CHECKS_PER_SANDBOX;
            sandbox_checks.drain(0..excess);
        }
    }

    /// Recent observations for a sandbox, oldest first
    pub async fn get_health_checks(&self, sandbox_id: &str, limit: Option<usize>) -> Vec<HealthCheck> {
        let checks = self.checks.read().await;
        match checks.get(sandbox_id) {
            Some(sandbox_checks) => {
                let start = limit
                    .map(|limit| sandbox_checks.len().saturating_sub(limit))
                    .unwrap_or(0);
                sandbox_checks[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub async fn get_latest_check(&self, sandbox_id: &str) -> Option<HealthCheck> {
        self.checks
            .read()
            .await
            .get(sandbox_id)
            .and_then(|sandbox_checks| sandbox_checks.last().cloned())
    }

    pub async fn clear_checks(&self, sandbox_id: &str) {
        self.checks.write().await.remove(sandbox_id);
    }
}
