// ABOUTME: Per-user sandbox registry driving the lifecycle state machine
// ABOUTME: Single-flight creation, drift reconciliation, persistence and removal

use crate::health::{HealthError, HealthMonitor, RuntimeStatus};
use crate::providers::{ContainerConfig, ExecRequest, ExecStream, Provider, ProviderError};
use crate::settings::SandboxSettings;
use crate::state::{SandboxRecord, SandboxState, StateError, StateMachine, TransitionEvent};
use crate::storage::{SandboxStorage, StorageError};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default capacity of the transition event channel
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 256;

/// Bound on drift-recovery passes inside one acquire call
const MAX_ACQUIRE_ATTEMPTS: usize = 4;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox creation failed for {user_id}: {reason}")]
    CreationFailed { user_id: String, reason: String },

    #[error("Sandbox for {user_id} not healthy after {timeout:?}")]
    HealthTimeout { user_id: String, timeout: Duration },

    #[error("Sandbox for {user_id} is unhealthy: {reason}")]
    Unhealthy { user_id: String, reason: String },

    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("No sandbox registered for {0}")]
    NotFound(String),

    #[error("Sandbox for {user_id} is busy ({state})")]
    Busy { user_id: String, state: SandboxState },
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// A ready sandbox a caller may execute in
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub user_id: String,
    /// Container name, also used as the runtime id
    pub sandbox_id: String,
    pub state: SandboxState,
}

/// Per-call overrides for sandbox creation
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    pub image: Option<String>,
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub checked: usize,
    pub healthy: usize,
    pub reset: usize,
    pub marked_dead: usize,
    pub skipped: usize,
}

/// Error kind of a failed creation, replayed to callers that joined it
#[derive(Debug, Clone)]
enum CreationFailure {
    HealthTimeout(Duration),
    Unhealthy(String),
    Other(String),
}

impl CreationFailure {
    fn from_error(error: &ManagerError) -> Self {
        match error {
            ManagerError::HealthTimeout { timeout, .. } => Self::HealthTimeout(*timeout),
            ManagerError::Unhealthy { reason, .. } => Self::Unhealthy(reason.clone()),
            ManagerError::CreationFailed { reason, .. } => Self::Other(reason.clone()),
            other => Self::Other(other.to_string()),
        }
    }

    fn into_error(self, user_id: &str) -> ManagerError {
        let user_id = user_id.to_string();
        match self {
            Self::HealthTimeout(timeout) => ManagerError::HealthTimeout { user_id, timeout },
            Self::Unhealthy(reason) => ManagerError::Unhealthy { user_id, reason },
            Self::Other(reason) => ManagerError::CreationFailed { user_id, reason },
        }
    }
}

pub struct SandboxManager {
    provider: Arc<dyn Provider>,
    health: Arc<HealthMonitor>,
    storage: Option<Arc<SandboxStorage>>,
    settings: SandboxSettings,
    machines: RwLock<HashMap<String, Arc<StateMachine>>>,
    failures: RwLock<HashMap<String, CreationFailure>>,
    events: broadcast::Sender<TransitionEvent>,
}

impl SandboxManager {
    pub fn new(
        provider: Arc<dyn Provider>,
        health: Arc<HealthMonitor>,
        settings: SandboxSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_SIZE);
        Self {
            provider,
            health,
            storage: None,
            settings,
            machines: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn with_storage(mut self, storage: Arc<SandboxStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Subscribe to every transition of every sandbox
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Deterministic container name for a user.
    ///
    /// Ids that are not already valid container name characters are mapped
    /// and suffixed with a hash of the original so distinct ids stay distinct.
    pub fn sandbox_name_for(&self, user_id: &str) -> Result<String> {
        if user_id.trim().is_empty() || user_id.len() > 128 {
            return Err(ManagerError::InvalidUserId(user_id.to_string()));
        }

        let sanitized: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();

        if sanitized == user_id {
            Ok(format!("{}-{}", self.settings.name_prefix, sanitized))
        } else {
            Ok(format!(
                "{}-{}-{:08x}",
                self.settings.name_prefix,
                sanitized,
                fnv1a(user_id.as_bytes()) as u32
            ))
        }
    }

    async fn machine_for(&self, user_id: &str) -> Result<Arc<StateMachine>> {
        if let Some(machine) = self.machines.read().await.get(user_id) {
            return Ok(machine.clone());
        }

        let name = self.sandbox_name_for(user_id)?;
        let mut machines = self.machines.write().await;
        let machine = machines
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(StateMachine::new(user_id, name, self.events.clone())));
        Ok(machine.clone())
    }

    async fn existing_machine(&self, user_id: &str) -> Option<Arc<StateMachine>> {
        self.machines.read().await.get(user_id).cloned()
    }

    fn handle(user_id: &str, machine: &StateMachine) -> SandboxHandle {
        SandboxHandle {
            user_id: user_id.to_string(),
            sandbox_id: machine.sandbox_name(),
            state: machine.state(),
        }
    }

    /// Return the user's ready sandbox, creating it if needed.
    ///
    /// Concurrent callers for the same user share one creation sequence.
    pub async fn get_or_create_sandbox(
        self: &Arc<Self>,
        user_id: &str,
        options: SandboxOptions,
    ) -> Result<SandboxHandle> {
        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            let machine = self.machine_for(user_id).await?;
            let state = machine.state();
            debug!(
                "Acquiring sandbox for {} (state: {}, attempt: {})",
                user_id, state, attempt
            );

            match state {
                SandboxState::Ready => {
                    let name = machine.sandbox_name();
                    match self.health.get_status(&name).await {
                        RuntimeStatus::Running => return Ok(Self::handle(user_id, &machine)),
                        RuntimeStatus::Removed => {
                            warn!("Sandbox {} disappeared, recreating", name);
                            machine.force_reset();
                        }
                        RuntimeStatus::Exited => {
                            warn!("Sandbox {} exited, marking dead", name);
                            if let Err(e) = machine.transition_to(
                                SandboxState::Dead,
                                Some(json!({ "reason": "container exited" })),
                            ) {
                                debug!("Dead transition raced: {}", e);
                            }
                        }
                    }
                }
                SandboxState::Failed | SandboxState::Dead => {
                    debug!("Resetting {} sandbox for {} before retry", state, user_id);
                    machine.force_reset();
                }
                SandboxState::NonExistent => {
                    let claimed = machine.claim_creation(Some(json!({
                        "image": options.image.as_deref().unwrap_or(self.settings.image.as_str()),
                    })))?;
                    if claimed {
                        self.failures.write().await.remove(user_id);
                        return self.spawn_creation(machine, user_id, options).await;
                    }
                }
                SandboxState::Creating | SandboxState::Starting | SandboxState::HealthChecking => {
                    debug!("Joining in-flight creation for {}", user_id);
                    let settled = machine.wait_for_stable(None).await?;
                    return self.settle(user_id, &machine, settled).await;
                }
                SandboxState::Stopping | SandboxState::Removing => {
                    machine.wait_for_stable(None).await?;
                }
            }
        }

        Err(ManagerError::CreationFailed {
            user_id: user_id.to_string(),
            reason: format!(
                "sandbox state did not settle after {} attempts",
                MAX_ACQUIRE_ATTEMPTS
            ),
        })
    }

    /// Outcome for a caller that joined someone else's creation
    async fn settle(
        &self,
        user_id: &str,
        machine: &StateMachine,
        settled: SandboxState,
    ) -> Result<SandboxHandle> {
        if settled == SandboxState::Ready {
            return Ok(Self::handle(user_id, machine));
        }
        let failure = self.failures.read().await.get(user_id).cloned();
        match failure {
            Some(failure) => Err(failure.into_error(user_id)),
            None => Err(ManagerError::CreationFailed {
                user_id: user_id.to_string(),
                reason: machine
                    .last_error()
                    .unwrap_or_else(|| format!("sandbox settled in {}", settled)),
            }),
        }
    }

    /// Run the creation sequence on its own task so a caller that goes away
    /// cannot leave the record inside the creation span.
    async fn spawn_creation(
        self: &Arc<Self>,
        machine: Arc<StateMachine>,
        user_id: &str,
        options: SandboxOptions,
    ) -> Result<SandboxHandle> {
        let manager = Arc::clone(self);
        let task_machine = Arc::clone(&machine);
        let user = user_id.to_string();

        let task = tokio::spawn(async move {
            let result = manager.run_creation(&task_machine, &user, options).await;
            if let Err(e) = &result {
                // Stored before the Failed transition wakes any joiners
                manager
                    .failures
                    .write()
                    .await
                    .insert(user.clone(), CreationFailure::from_error(e));
                task_machine.set_failed(e.to_string());
                task_machine.end_creation();
            }
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Creation task for {} did not complete: {}", user_id, e);
                self.failures.write().await.insert(
                    user_id.to_string(),
                    CreationFailure::Other(format!("creation task aborted: {}", e)),
                );
                machine.set_failed(format!("creation task aborted: {}", e));
                machine.end_creation();
                Err(ManagerError::CreationFailed {
                    user_id: user_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn container_config(&self, user_id: &str, name: &str, options: SandboxOptions) -> ContainerConfig {
        ContainerConfig {
            image: options.image.unwrap_or_else(|| self.settings.image.clone()),
            name: name.to_string(),
            env_vars: options.env_vars,
            cpu_cores: self.settings.cpu_cores,
            memory_mb: self.settings.memory_mb,
            command: Some(self.settings.command.clone()),
            working_dir: Some(self.settings.working_dir.clone()),
            labels: HashMap::from([(
                format!("{}.user_id", crate::providers::docker::LABEL_PREFIX),
                user_id.to_string(),
            )]),
        }
    }

    async fn run_creation(
        &self,
        machine: &StateMachine,
        user_id: &str,
        options: SandboxOptions,
    ) -> Result<SandboxHandle> {
        let name = machine.sandbox_name();
        let creation_failed = |e: ProviderError| ManagerError::CreationFailed {
            user_id: user_id.to_string(),
            reason: e.to_string(),
        };

        info!("Creating sandbox {} for user {}", name, user_id);
        let config = self.container_config(user_id, &name, options);

        let container_id = match self.provider.create_container(&config).await {
            Ok(id) => id,
            Err(ProviderError::Conflict(_)) => {
                info!("Container {} already exists, adopting it", name);
                self.provider
                    .inspect_container(&name)
                    .await
                    .map_err(creation_failed)?
                    .id
            }
            Err(e) => return Err(creation_failed(e)),
        };

        machine.transition_to(
            SandboxState::Starting,
            Some(json!({ "container_id": container_id })),
        )?;
        self.provider
            .start_container(&name)
            .await
            .map_err(creation_failed)?;

        machine.transition_to(SandboxState::HealthChecking, None)?;
        let timeout = self.settings.health_timeout;
        self.health
            .wait_until_ready(&name, timeout)
            .await
            .map_err(|e| match e {
                HealthError::Timeout { .. } => ManagerError::HealthTimeout {
                    user_id: user_id.to_string(),
                    timeout,
                },
                HealthError::Unhealthy { reason, .. } => ManagerError::Unhealthy {
                    user_id: user_id.to_string(),
                    reason,
                },
                other @ HealthError::Exited { .. } => ManagerError::CreationFailed {
                    user_id: user_id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        machine.transition_to(SandboxState::Ready, None)?;
        machine.end_creation();
        info!("Sandbox {} ready for user {}", name, user_id);

        Ok(Self::handle(user_id, machine))
    }

    /// Ensure the user's sandbox is ready, then start `request` inside it
    pub async fn exec_in_container(
        self: &Arc<Self>,
        user_id: &str,
        request: &ExecRequest,
    ) -> Result<(ExecStream, SandboxHandle)> {
        let handle = self
            .get_or_create_sandbox(user_id, SandboxOptions::default())
            .await?;
        let stream = self
            .provider
            .exec_stream(&handle.sandbox_id, request)
            .await?;
        Ok((stream, handle))
    }

    /// Exit code of a finished exec; lookup failures read as unknown
    pub async fn exec_exit_code(&self, exec_id: &str) -> Option<i64> {
        match self.provider.exec_exit_code(exec_id).await {
            Ok(code) => code,
            Err(e) => {
                debug!("Could not inspect exec {}: {}", exec_id, e);
                None
            }
        }
    }

    /// Stop and remove a user's sandbox, returning the record to NonExistent
    pub async fn remove_sandbox(&self, user_id: &str) -> Result<()> {
        let machine = self
            .existing_machine(user_id)
            .await
            .ok_or_else(|| ManagerError::NotFound(user_id.to_string()))?;
        let name = machine.sandbox_name();
        let state = machine.state();

        if machine.is_creation_in_flight() {
            return Err(ManagerError::Busy {
                user_id: user_id.to_string(),
                state,
            });
        }

        match state {
            SandboxState::Ready => {
                if !machine.transition_to(SandboxState::Stopping, None)? {
                    return Err(ManagerError::Busy {
                        user_id: user_id.to_string(),
                        state: SandboxState::Stopping,
                    });
                }
                if let Err(e) = self.stop_and_remove(&machine, &name).await {
                    machine.set_failed(e.to_string());
                    return Err(e.into());
                }
            }
            SandboxState::Failed | SandboxState::Dead | SandboxState::NonExistent => {
                self.remove_if_present(&name).await?;
                machine.force_reset();
            }
            other => {
                return Err(ManagerError::Busy {
                    user_id: user_id.to_string(),
                    state: other,
                })
            }
        }

        self.health.clear_checks(&name).await;
        self.failures.write().await.remove(user_id);
        info!("Removed sandbox {} for user {}", name, user_id);
        Ok(())
    }

    async fn stop_and_remove(
        &self,
        machine: &StateMachine,
        name: &str,
    ) -> std::result::Result<(), ProviderError> {
        match self
            .provider
            .stop_container(name, self.settings.stop_timeout_secs)
            .await
        {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.advance(machine, SandboxState::Removing);

        self.remove_if_present(name).await?;
        self.advance(machine, SandboxState::NonExistent);
        Ok(())
    }

    fn advance(&self, machine: &StateMachine, to: SandboxState) {
        if let Err(e) = machine.transition_to(to, None) {
            warn!("Unexpected transition failure during removal: {}", e);
        }
    }

    async fn remove_if_present(&self, name: &str) -> std::result::Result<(), ProviderError> {
        match self.provider.remove_container(name, true).await {
            Ok(()) => Ok(()),
            Err(ProviderError::NotFound(_)) => {
                debug!("Container {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Load persisted records and reconcile them against the runtime in the
    /// background. Returns how many records were restored.
    pub async fn restore(self: &Arc<Self>) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let records = storage.list_records().await?;
        let mut restored = 0;
        {
            let mut machines = self.machines.write().await;
            for record in records {
                if machines.contains_key(&record.user_id) {
                    continue;
                }
                let user_id = record.user_id.clone();
                let machine = StateMachine::from_persisted(record, self.events.clone());
                debug!("Restored {} sandbox record for {}", machine.state(), user_id);
                machines.insert(user_id, Arc::new(machine));
                restored += 1;
            }
        }
        info!("Restored {} sandbox records", restored);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let report = manager.reconcile_all().await;
            info!("Startup reconciliation finished: {:?}", report);
        });

        Ok(restored)
    }

    /// Bring Ready records in line with what the runtime reports
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let machines: Vec<_> = self.machines.read().await.values().cloned().collect();
        let mut report = ReconcileReport::default();

        for machine in machines {
            report.checked += 1;
            if machine.is_creation_in_flight() || machine.state() != SandboxState::Ready {
                report.skipped += 1;
                continue;
            }

            let name = machine.sandbox_name();
            match self.health.get_status(&name).await {
                RuntimeStatus::Running => report.healthy += 1,
                RuntimeStatus::Removed => {
                    info!("Reconcile: sandbox {} is gone, resetting record", name);
                    if machine.force_reset() {
                        report.reset += 1;
                    }
                }
                RuntimeStatus::Exited => {
                    info!("Reconcile: sandbox {} exited, marking dead", name);
                    match machine.transition_to(
                        SandboxState::Dead,
                        Some(json!({ "reason": "reconcile: container exited" })),
                    ) {
                        Ok(_) => report.marked_dead += 1,
                        Err(e) => debug!("Reconcile transition for {} raced: {}", name, e),
                    }
                }
            }
        }

        report
    }

    /// Periodically reconcile until the manager is dropped
    pub fn start_reconcile_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            info!("Started sandbox reconcile task (interval: {:?})", interval);

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Sandbox manager dropped, stopping reconcile task");
                    break;
                };
                let report = manager.reconcile_all().await;
                if report.reset + report.marked_dead > 0 {
                    info!("Reconcile pass corrected drift: {:?}", report);
                }
            }
        })
    }

    /// Persist records whenever they reach a stable state
    pub fn start_persistence(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.storage.as_ref()?;
        let mut events = self.events.subscribe();
        let manager: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                let outcome = events.recv().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match outcome {
                    Ok(event) if event.to.is_stable() => manager.persist(&event.user_id).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "Persistence lagged by {} transitions, saving all records",
                            skipped
                        );
                        manager.persist_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    async fn persist(&self, user_id: &str) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(machine) = self.existing_machine(user_id).await else {
            return;
        };
        let record = machine.snapshot().to_persisted();
        if let Err(e) = storage.upsert_record(&record).await {
            error!("Failed to persist sandbox record for {}: {}", user_id, e);
        }
    }

    pub async fn persist_all(&self) {
        let users: Vec<String> = self.machines.read().await.keys().cloned().collect();
        for user_id in users {
            self.persist(&user_id).await;
        }
    }

    pub async fn get_record(&self, user_id: &str) -> Option<SandboxRecord> {
        self.existing_machine(user_id)
            .await
            .map(|machine| machine.snapshot())
    }

    pub async fn list_records(&self) -> Vec<SandboxRecord> {
        let mut records: Vec<_> = self
            .machines
            .read()
            .await
            .values()
            .map(|machine| machine.snapshot())
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}
