// ABOUTME: Docker runtime client for per-user sandbox containers
// ABOUTME: Uses bollard for container lifecycle, inspection and streamed exec

use super::{
    ContainerConfig, ContainerInspect, ContainerStatus, ExecRequest, ExecStream, OutputChunk,
    HealthcheckStatus, Provider, ProviderError, Result,
};
use async_stream::stream;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HealthStatusEnum,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub const LABEL_PREFIX: &str = "corral";

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    /// Images known to be present locally, with the time they were pulled
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect with local defaults and a 10 minute image pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client_and_timeout(client, timeout))
    }

    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            label_prefix: LABEL_PREFIX.to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    fn to_bollard_config(label_prefix: &str, config: &ContainerConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", label_prefix), "true".to_string());
        labels.insert(format!("{}.name", label_prefix), config.name.clone());

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            cpu_shares: Some((config.cpu_cores * 1024.0) as i64),
            memory: Some((config.memory_mb * 1024 * 1024) as i64),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: config.command.clone(),
            env: Some(env),
            working_dir: config.working_dir.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn map_error(container_id: &str, e: BollardError) -> ProviderError {
        match e {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => ProviderError::NotFound(format!("{}: {}", container_id, message)),
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => ProviderError::Conflict(format!("{}: {}", container_id, message)),
            other => ProviderError::ContainerError(other.to_string()),
        }
    }

    fn is_not_modified(e: &BollardError) -> bool {
        matches!(
            e,
            BollardError::DockerResponseServerError {
                status_code: 304,
                ..
            }
        )
    }

    fn convert_healthcheck(status: Option<HealthStatusEnum>) -> Option<HealthcheckStatus> {
        match status? {
            HealthStatusEnum::STARTING => Some(HealthcheckStatus::Starting),
            HealthStatusEnum::HEALTHY => Some(HealthcheckStatus::Healthy),
            HealthStatusEnum::UNHEALTHY => Some(HealthcheckStatus::Unhealthy),
            HealthStatusEnum::EMPTY | HealthStatusEnum::NONE => None,
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }
        if self.image_exists(image).await? {
            self.image_cache
                .write()
                .await
                .insert(image.to_string(), chrono::Utc::now());
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            while let Some(progress) = pull.next().await {
                let info = progress.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    debug!("Pull status for {}: {}", image, status);
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Image pull failed: {}", e);
                Err(e)
            }
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timed out pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);

        self.ensure_image(&config.image).await?;

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(
                Some(options),
                Self::to_bollard_config(&self.label_prefix, config),
            )
            .await
            .map_err(|e| Self::map_error(&config.name, e))?;

        for warning in &container.warnings {
            warn!("Container {} created with warning: {}", config.name, warning);
        }
        debug!("Created container {} ({})", config.name, container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);
        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_modified(&e) => {
                debug!("Container {} already running", container_id);
                Ok(())
            }
            Err(e) => Err(Self::map_error(container_id, e)),
        }
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );
        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_modified(&e) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(Self::map_error(container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| Self::map_error(container_id, e))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Self::map_error(container_id, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError(format!("Container {} has no state", container_id))
        })?;

        let raw_status = state
            .status
            .as_ref()
            .map(|s| s.as_ref().to_string())
            .unwrap_or_default();
        let status = ContainerStatus::parse(&raw_status).ok_or_else(|| {
            ProviderError::ContainerError(format!(
                "Container {} reported unknown status {:?}",
                container_id, raw_status
            ))
        })?;

        let health = state.health.as_ref();
        let health_log = health
            .and_then(|h| h.log.as_ref())
            .and_then(|log| log.last())
            .and_then(|entry| entry.output.clone());

        let has_healthcheck = inspect
            .config
            .as_ref()
            .and_then(|c| c.healthcheck.as_ref())
            .and_then(|hc| hc.test.as_ref())
            .map(|test| !test.is_empty() && test[0] != "NONE")
            .unwrap_or(false);

        Ok(ContainerInspect {
            id: inspect.id.clone().unwrap_or_else(|| container_id.to_string()),
            name: inspect
                .name
                .clone()
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            health: Self::convert_healthcheck(health.and_then(|h| h.status)),
            has_healthcheck,
            health_log,
        })
    }

    async fn exec_stream(&self, container_id: &str, request: &ExecRequest) -> Result<ExecStream> {
        info!(
            "Executing command in container {}: {:?}",
            container_id, request.command
        );

        let env: Vec<String> = request
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(request.command.clone()),
            env: (!env.is_empty()).then_some(env),
            working_dir: request.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| Self::map_error(container_id, e))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let mut output = match started {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ProviderError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let chunks = stream! {
            while let Some(item) = output.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        yield Ok(OutputChunk::stdout(message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        yield Ok(OutputChunk::stderr(message));
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        yield Err(ProviderError::ExecError(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(ExecStream {
            exec_id: exec.id,
            output: chunks.boxed(),
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }
}
