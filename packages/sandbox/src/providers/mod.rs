// ABOUTME: Container runtime client interface used by the sandbox lifecycle
// ABOUTME: Defines the Provider trait, inspect/exec types and stream demultiplexing

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

pub mod demux;
pub mod docker;

pub use demux::{demux, Demuxed};
pub use docker::DockerProvider;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container name conflict: {0}")]
    Conflict(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Container configuration for creating sandboxes
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn parse(state: &str) -> Option<Self> {
        match state.to_lowercase().as_str() {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "restarting" => Some(Self::Restarting),
            "removing" => Some(Self::Removing),
            "exited" => Some(Self::Exited),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// Result of the container's own healthcheck, when it defines one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthcheckStatus {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub health: Option<HealthcheckStatus>,
    pub has_healthcheck: bool,
    /// Output of the most recent healthcheck run, if the runtime reports one
    pub health_log: Option<String>,
}

/// Command to run inside an existing sandbox
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env_vars: HashMap<String, String>,
}

impl ExecRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn new(stream: StreamType, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stream,
            data: data.into(),
        }
    }

    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self::new(StreamType::Stdout, data)
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self::new(StreamType::Stderr, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Live combined output of a started exec
pub struct ExecStream {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<OutputChunk>>,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

/// Runtime backend for sandbox containers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the runtime is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Create (but do not start) a container, returning its id.
    ///
    /// Fails with `ProviderError::Conflict` when the name is already taken.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Start a created or stopped container; starting a running one is a no-op
    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Inspect a container; `ProviderError::NotFound` when it does not exist
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect>;

    /// Start a command and attach to its combined output
    async fn exec_stream(&self, container_id: &str, request: &ExecRequest) -> Result<ExecStream>;

    /// Exit code of a finished exec, `None` while it is still running
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;
}
