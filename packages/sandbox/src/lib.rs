// ABOUTME: Per-user Docker sandbox lifecycle, command streaming and agent protocol translation
// ABOUTME: Exposes the sandbox manager, stream executor, session table and record storage

pub mod executor;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod providers;
pub mod sessions;
pub mod settings;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_utils;

pub use executor::{ExecutorError, RunOutcome, RunRequest, StderrClassifier, StreamExecutor};
pub use health::{HealthError, HealthInfo, HealthMonitor, HealthStatus, RuntimeStatus};
pub use manager::{
    ManagerError, ReconcileReport, SandboxHandle, SandboxManager, SandboxOptions,
};
pub use protocol::{EventSink, OutboundEvent, ProtocolTranslator, SessionState};
pub use providers::{
    ContainerConfig, ContainerInspect, ContainerStatus, DockerProvider, ExecRequest, ExecStream,
    OutputChunk, HealthcheckStatus, Provider, ProviderError, StreamType,
};
pub use sessions::{
    AbortSignal, SessionError, SessionInfo, SessionPatch, SessionSnapshot, SessionStatus,
    SessionTable, StreamHandle,
};
pub use settings::{SandboxSettings, SettingsError};
pub use state::{
    PersistedRecord, SandboxRecord, SandboxState, StateError, StateHistoryEntry, StateMachine,
    TransitionEvent,
};
pub use storage::{SandboxStorage, StorageError};
