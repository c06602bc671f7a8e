// ABOUTME: Shared fixtures for sandbox integration tests
// ABOUTME: A scripted in-memory container runtime and manager builders

#![allow(dead_code)]

use async_trait::async_trait;
use corral_sandbox::providers::Result;
use corral_sandbox::{
    ContainerConfig, ContainerInspect, ContainerStatus, ExecRequest, ExecStream, HealthMonitor,
    OutputChunk, Provider, ProviderError, SandboxManager, SandboxSettings,
};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exec output the fake runtime replays
pub enum Script {
    Chunks(Vec<OutputChunk>, Duration),
    Endless,
}

#[derive(Default)]
pub struct FakeRuntime {
    latency: Duration,
    containers: Mutex<HashMap<String, ContainerStatus>>,
    scripts: Mutex<VecDeque<Script>>,
    dropped_streams: Arc<AtomicUsize>,
    pub creates: AtomicUsize,
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn insert(&self, name: &str, status: ContainerStatus) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Endless exec streams their consumer has dropped
    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn set(&self, name: &str, status: ContainerStatus) -> Result<()> {
        match self.containers.lock().unwrap().get_mut(name) {
            Some(current) => {
                *current = status;
                Ok(())
            }
            None => Err(ProviderError::NotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl Provider for FakeRuntime {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&config.name) {
            return Err(ProviderError::Conflict(config.name.clone()));
        }
        containers.insert(config.name.clone(), ContainerStatus::Created);
        Ok(config.name.clone())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.pause().await;
        self.set(container_id, ContainerStatus::Running)
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> Result<()> {
        self.set(container_id, ContainerStatus::Exited)
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        self.containers
            .lock()
            .unwrap()
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect> {
        let status = self
            .containers
            .lock()
            .unwrap()
            .get(container_id)
            .copied()
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        Ok(ContainerInspect {
            id: container_id.to_string(),
            name: container_id.to_string(),
            status,
            health: None,
            has_healthcheck: false,
            health_log: None,
        })
    }

    async fn exec_stream(&self, container_id: &str, _request: &ExecRequest) -> Result<ExecStream> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Chunks(Vec::new(), Duration::ZERO));
        let output = match script {
            Script::Chunks(chunks, delay) => stream::iter(chunks)
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    Ok(chunk)
                })
                .boxed(),
            Script::Endless => {
                let guard = DropCounter(Arc::clone(&self.dropped_streams));
                stream::pending::<Result<OutputChunk>>()
                    .map(move |item| {
                        let _ = &guard;
                        item
                    })
                    .boxed()
            }
        };
        Ok(ExecStream {
            exec_id: format!("exec-{}", container_id),
            output,
        })
    }

    async fn exec_exit_code(&self, _exec_id: &str) -> Result<Option<i64>> {
        Ok(Some(0))
    }
}

pub fn test_settings() -> SandboxSettings {
    SandboxSettings {
        health_poll_interval: Duration::from_millis(10),
        health_timeout: Duration::from_secs(5),
        reconcile_interval: None,
        ..Default::default()
    }
}

pub fn manager(runtime: Arc<FakeRuntime>) -> SandboxManager {
    let settings = test_settings();
    let health = Arc::new(HealthMonitor::with_poll_interval(
        runtime.clone(),
        settings.health_poll_interval,
    ));
    SandboxManager::new(runtime, health, settings)
}
