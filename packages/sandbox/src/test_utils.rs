// ABOUTME: In-memory Provider used by unit tests across the sandbox crate
// ABOUTME: Simulates container state, healthchecks and scripted exec output

use crate::providers::{
    ContainerConfig, ContainerInspect, ContainerStatus, ExecRequest, ExecStream, OutputChunk,
    HealthcheckStatus, Provider, ProviderError, Result,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockContainer {
    status: ContainerStatus,
}

/// Output a scripted exec produces
#[derive(Debug, Clone)]
pub enum ExecScript {
    /// Yield these chunks, pausing `delay` before each one
    Chunks {
        chunks: Vec<OutputChunk>,
        delay: Duration,
    },
    /// Never produce output and never end
    Endless,
    /// Yield these chunks, then fail mid-stream
    Broken {
        chunks: Vec<OutputChunk>,
        error: ProviderError,
    },
    /// Fail the exec call itself
    Fail(ProviderError),
}

/// Counts exec streams dropped by whoever consumed them
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockProvider {
    latency: Duration,
    containers: Mutex<HashMap<String, MockContainer>>,
    has_healthcheck: bool,
    healthcheck_script: Mutex<VecDeque<HealthcheckStatus>>,
    status_after_start: Mutex<Option<ContainerStatus>>,
    create_error: Mutex<Option<ProviderError>>,
    exec_scripts: Mutex<VecDeque<ExecScript>>,
    exit_code: Mutex<Option<i64>>,
    dropped_streams: Arc<AtomicUsize>,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub inspect_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            exit_code: Mutex::new(Some(0)),
            ..Default::default()
        }
    }

    /// Delay every runtime call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report a container healthcheck whose status walks through `script`,
    /// staying healthy once the script is exhausted
    pub fn with_healthcheck(mut self, script: Vec<HealthcheckStatus>) -> Self {
        self.has_healthcheck = true;
        self.healthcheck_script = Mutex::new(script.into());
        self
    }

    /// Containers land in `status` instead of running when started
    pub fn with_status_after_start(self, status: ContainerStatus) -> Self {
        *self.status_after_start.lock().unwrap() = Some(status);
        self
    }

    pub fn with_exit_code(self, code: Option<i64>) -> Self {
        *self.exit_code.lock().unwrap() = code;
        self
    }

    pub fn fail_next_create(&self, err: ProviderError) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    pub fn push_exec(&self, script: ExecScript) {
        self.exec_scripts.lock().unwrap().push_back(script);
    }

    /// Register a container that exists before any create call
    pub fn insert_container(&self, name: &str, status: ContainerStatus) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), MockContainer { status });
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.status = status;
        }
    }

    /// Simulate the container vanishing outside our control
    pub fn remove_externally(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Endless exec streams that have been dropped
    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }

        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&config.name) {
            return Err(ProviderError::Conflict(config.name.clone()));
        }
        containers.insert(
            config.name.clone(),
            MockContainer {
                status: ContainerStatus::Created,
            },
        );
        Ok(config.name.clone())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let target = self
            .status_after_start
            .lock()
            .unwrap()
            .unwrap_or(ContainerStatus::Running);
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        container.status = target;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.containers
            .lock()
            .unwrap()
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.status)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;

        let health = if self.has_healthcheck && status == ContainerStatus::Running {
            Some(
                self.healthcheck_script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(HealthcheckStatus::Healthy),
            )
        } else {
            None
        };

        Ok(ContainerInspect {
            id: container_id.to_string(),
            name: container_id.to_string(),
            status,
            health,
            has_healthcheck: self.has_healthcheck,
            health_log: None,
        })
    }

    async fn exec_stream(&self, container_id: &str, _request: &ExecRequest) -> Result<ExecStream> {
        if !self.contains(container_id) {
            return Err(ProviderError::NotFound(container_id.to_string()));
        }

        let script = self
            .exec_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExecScript::Chunks {
                chunks: Vec::new(),
                delay: Duration::ZERO,
            });

        let output = match script {
            ExecScript::Chunks { chunks, delay } => stream::iter(chunks)
                .then(move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(chunk)
                })
                .boxed(),
            ExecScript::Endless => {
                let guard = DropCounter(Arc::clone(&self.dropped_streams));
                stream::pending::<Result<OutputChunk>>()
                    .map(move |item| {
                        let _ = &guard;
                        item
                    })
                    .boxed()
            }
            ExecScript::Broken { chunks, error } => stream::iter(chunks)
                .map(Ok)
                .chain(stream::once(async move { Err(error) }))
                .boxed(),
            ExecScript::Fail(err) => return Err(err),
        };

        Ok(ExecStream {
            exec_id: format!("exec-{}", container_id),
            output,
        })
    }

    async fn exec_exit_code(&self, _exec_id: &str) -> Result<Option<i64>> {
        Ok(*self.exit_code.lock().unwrap())
    }
}
