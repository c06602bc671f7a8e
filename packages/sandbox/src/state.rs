// ABOUTME: Per-user sandbox lifecycle state machine with guarded transitions
// ABOUTME: Tracks transition history, the creation guard, and async waiters for target states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Number of history entries kept per record
const MAX_HISTORY_ENTRIES: usize = 50;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Invalid state transition for {user_id}: {from} -> {to}")]
    InvalidTransition {
        user_id: String,
        from: SandboxState,
        to: SandboxState,
    },

    #[error("Timed out after {0:?} waiting for sandbox state")]
    WaitTimeout(Duration),

    #[error("State machine for {0} dropped its waiters")]
    Closed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    NonExistent,
    Creating,
    Starting,
    HealthChecking,
    Ready,
    Stopping,
    Removing,
    Failed,
    Dead,
}

/// States a sandbox can sit in indefinitely
pub const STABLE_STATES: &[SandboxState] = &[
    SandboxState::NonExistent,
    SandboxState::Ready,
    SandboxState::Dead,
    SandboxState::Failed,
];

/// States with no outgoing table entries
pub const TERMINAL_STATES: &[SandboxState] = &[
    SandboxState::NonExistent,
    SandboxState::Dead,
    SandboxState::Failed,
];

impl SandboxState {
    pub const ALL: [SandboxState; 9] = [
        Self::NonExistent,
        Self::Creating,
        Self::Starting,
        Self::HealthChecking,
        Self::Ready,
        Self::Stopping,
        Self::Removing,
        Self::Failed,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonExistent => "non_existent",
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::HealthChecking => "health_checking",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Removing => "removing",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StateError::InvalidState(s.to_string()))
    }

    pub fn is_stable(&self) -> bool {
        STABLE_STATES.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATES.contains(self)
    }

    /// Creating, Starting and HealthChecking: the span a creation sequence owns
    pub fn is_creation_span(&self) -> bool {
        matches!(self, Self::Creating | Self::Starting | Self::HealthChecking)
    }

    pub fn allowed_targets(&self) -> &'static [SandboxState] {
        use SandboxState::*;
        match self {
            NonExistent => &[Creating],
            Creating => &[Starting, Failed, Removing],
            Starting => &[HealthChecking, Failed, Stopping],
            HealthChecking => &[Ready, Failed, Stopping],
            Ready => &[HealthChecking, Stopping, Failed, Dead],
            Stopping => &[Removing, Dead, Failed],
            Removing => &[NonExistent, Dead, Failed],
            Failed => &[],
            Dead => &[],
        }
    }

    pub fn can_transition_to(&self, to: SandboxState) -> bool {
        *self == to || self.allowed_targets().contains(&to)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub from: SandboxState,
    pub to: SandboxState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// Emitted on every successful transition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub from: SandboxState,
    pub to: SandboxState,
    pub user_id: String,
    pub sandbox_name: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<JsonValue>,
}

/// Live lifecycle record for one user's sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub user_id: String,
    pub sandbox_name: String,
    pub current_state: SandboxState,
    pub previous_state: Option<SandboxState>,
    pub state_history: Vec<StateHistoryEntry>,
    pub last_transition_time: DateTime<Utc>,
    pub last_error: Option<String>,
    pub creation_guard: bool,
}

impl SandboxRecord {
    pub fn new(user_id: impl Into<String>, sandbox_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            sandbox_name: sandbox_name.into(),
            current_state: SandboxState::NonExistent,
            previous_state: None,
            state_history: Vec::new(),
            last_transition_time: Utc::now(),
            last_error: None,
            creation_guard: false,
        }
    }

    pub fn to_persisted(&self) -> PersistedRecord {
        PersistedRecord {
            user_id: self.user_id.clone(),
            sandbox_name: self.sandbox_name.clone(),
            current_state: self.current_state,
            state_history: self.state_history.clone(),
            last_transition_time: self.last_transition_time,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serialized form of a record as written to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub user_id: String,
    pub sandbox_name: String,
    pub current_state: SandboxState,
    #[serde(default)]
    pub state_history: Vec<StateHistoryEntry>,
    pub last_transition_time: DateTime<Utc>,
    pub last_error: Option<String>,
}

struct Waiter {
    targets: Vec<SandboxState>,
    tx: oneshot::Sender<SandboxState>,
}

struct MachineInner {
    record: SandboxRecord,
    waiters: Vec<Waiter>,
}

/// Finite-state machine guarding one user's sandbox lifecycle.
///
/// All mutation happens under a short synchronous lock that is never held
/// across an `.await`, so the machine can be shared freely between tasks.
pub struct StateMachine {
    inner: Mutex<MachineInner>,
    events: broadcast::Sender<TransitionEvent>,
}

impl StateMachine {
    pub fn new(
        user_id: impl Into<String>,
        sandbox_name: impl Into<String>,
        events: broadcast::Sender<TransitionEvent>,
    ) -> Self {
        Self::from_record(SandboxRecord::new(user_id, sandbox_name), events)
    }

    /// Rehydrate a machine from storage.
    ///
    /// A creation sequence cannot survive a process restart, so a persisted
    /// Creating/Starting/HealthChecking state collapses to NonExistent.
    pub fn from_persisted(
        persisted: PersistedRecord,
        events: broadcast::Sender<TransitionEvent>,
    ) -> Self {
        let mut current_state = persisted.current_state;
        let mut previous_state = persisted.state_history.last().map(|entry| entry.from);

        if current_state.is_creation_span() {
            info!(
                "Collapsing persisted {} state to non_existent for user {}",
                current_state, persisted.user_id
            );
            previous_state = Some(current_state);
            current_state = SandboxState::NonExistent;
        }

        let record = SandboxRecord {
            user_id: persisted.user_id,
            sandbox_name: persisted.sandbox_name,
            current_state,
            previous_state,
            state_history: persisted.state_history,
            last_transition_time: persisted.last_transition_time,
            last_error: persisted.last_error,
            creation_guard: false,
        };

        Self::from_record(record, events)
    }

    fn from_record(record: SandboxRecord, events: broadcast::Sender<TransitionEvent>) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                record,
                waiters: Vec::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner> {
        // Every critical section leaves the record consistent, so a poisoned
        // lock still holds valid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SandboxState {
        self.lock().record.current_state
    }

    pub fn user_id(&self) -> String {
        self.lock().record.user_id.clone()
    }

    pub fn sandbox_name(&self) -> String {
        self.lock().record.sandbox_name.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().record.last_error.clone()
    }

    pub fn snapshot(&self) -> SandboxRecord {
        self.lock().record.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    pub fn is_creation_guarded(&self) -> bool {
        self.lock().record.creation_guard
    }

    /// True while a creation sequence owns this record
    pub fn is_creation_in_flight(&self) -> bool {
        let inner = self.lock();
        inner.record.creation_guard || inner.record.current_state.is_creation_span()
    }

    /// Validated transition. Returns whether the state actually changed;
    /// a self-transition is accepted and still emits an event.
    pub fn transition_to(&self, to: SandboxState, metadata: Option<JsonValue>) -> Result<bool> {
        let event = {
            let mut inner = self.lock();
            let from = inner.record.current_state;
            if !from.can_transition_to(to) {
                warn!(
                    "Rejected transition {} -> {} for user {}",
                    from, to, inner.record.user_id
                );
                return Err(StateError::InvalidTransition {
                    user_id: inner.record.user_id.clone(),
                    from,
                    to,
                });
            }
            Self::apply(&mut inner, to, metadata)
        };

        let changed = event.from != event.to;
        self.emit(event);
        Ok(changed)
    }

    /// Drive the record to Failed from any state and remember why
    pub fn set_failed(&self, error: impl Into<String>) {
        let error = error.into();
        let event = {
            let mut inner = self.lock();
            warn!(
                "Sandbox for user {} failed in state {}: {}",
                inner.record.user_id, inner.record.current_state, error
            );
            let event = Self::apply(
                &mut inner,
                SandboxState::Failed,
                Some(serde_json::json!({ "error": error })),
            );
            inner.record.last_error = Some(error);
            event
        };
        self.emit(event);
    }

    /// Reset to NonExistent bypassing the transition table.
    ///
    /// Refused (returns false) while a creation sequence holds the guard.
    pub fn force_reset(&self) -> bool {
        let event = {
            let mut inner = self.lock();
            if inner.record.creation_guard {
                debug!(
                    "Ignoring force reset for user {}: creation in progress",
                    inner.record.user_id
                );
                return false;
            }
            Self::apply(
                &mut inner,
                SandboxState::NonExistent,
                Some(serde_json::json!({ "reason": "force_reset" })),
            )
        };
        self.emit(event);
        true
    }

    /// Set the creation guard. Returns false if a creation is already in flight.
    pub fn begin_creation(&self) -> bool {
        let mut inner = self.lock();
        if inner.record.creation_guard || inner.record.current_state.is_creation_span() {
            return false;
        }
        inner.record.creation_guard = true;
        true
    }

    pub fn end_creation(&self) {
        self.lock().record.creation_guard = false;
    }

    /// Atomically claim the creation guard and enter Creating.
    ///
    /// Returns Ok(false) when another creation already owns the record, so
    /// concurrent callers cannot both start a sequence.
    pub fn claim_creation(&self, metadata: Option<JsonValue>) -> Result<bool> {
        let event = {
            let mut inner = self.lock();
            let from = inner.record.current_state;
            if inner.record.creation_guard || from.is_creation_span() {
                return Ok(false);
            }
            if !from.can_transition_to(SandboxState::Creating) {
                return Err(StateError::InvalidTransition {
                    user_id: inner.record.user_id.clone(),
                    from,
                    to: SandboxState::Creating,
                });
            }
            Self::apply(&mut inner, SandboxState::Creating, metadata)
        };
        self.emit(event);
        Ok(true)
    }

    /// Resolve with the first reached state in `targets`.
    ///
    /// Resolves immediately if the machine is already in a target, or sits in
    /// a terminal state that is not a target. `None` waits without limit.
    pub async fn wait_for_state(
        &self,
        targets: &[SandboxState],
        timeout: Option<Duration>,
    ) -> Result<SandboxState> {
        let (rx, user_id) = {
            let mut inner = self.lock();
            let current = inner.record.current_state;
            if targets.contains(&current) || current.is_terminal() {
                return Ok(current);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(Waiter {
                targets: targets.to_vec(),
                tx,
            });
            (rx, inner.record.user_id.clone())
        };

        match timeout.filter(|t| !t.is_zero()) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(state)) => Ok(state),
                Ok(Err(_)) => Err(StateError::Closed(user_id)),
                Err(_) => Err(StateError::WaitTimeout(limit)),
            },
            None => rx.await.map_err(|_| StateError::Closed(user_id)),
        }
    }

    pub async fn wait_for_stable(&self, timeout: Option<Duration>) -> Result<SandboxState> {
        self.wait_for_state(STABLE_STATES, timeout).await
    }

    fn apply(
        inner: &mut MachineInner,
        to: SandboxState,
        metadata: Option<JsonValue>,
    ) -> TransitionEvent {
        let now = Utc::now();
        let record = &mut inner.record;
        let from = record.current_state;

        record.previous_state = Some(from);
        record.current_state = to;
        record.last_transition_time = now;

        if to != SandboxState::Failed {
            record.last_error = None;
        }

        if to == SandboxState::Creating {
            record.creation_guard = true;
        } else if !to.is_creation_span() {
            record.creation_guard = false;
        }

        record.state_history.push(StateHistoryEntry {
            from,
            to,
            timestamp: now,
            metadata: metadata.clone(),
        });
        if record.state_history.len() > MAX_HISTORY_ENTRIES {
            let excess = record.state_history.len() - MAX_HISTORY_ENTRIES;
            record.state_history.drain(0..excess);
        }

        // One flat scan: a waiter registered several hops ago still fires here
        let waiters = std::mem::take(&mut inner.waiters);
        for waiter in waiters {
            if waiter.targets.contains(&to) || to.is_terminal() {
                let _ = waiter.tx.send(to);
            } else if !waiter.tx.is_closed() {
                inner.waiters.push(waiter);
            }
        }

        debug!("User {} sandbox: {} -> {}", inner.record.user_id, from, to);

        TransitionEvent {
            from,
            to,
            user_id: inner.record.user_id.clone(),
            sandbox_name: inner.record.sandbox_name.clone(),
            timestamp: now,
            metadata,
        }
    }

    fn emit(&self, event: TransitionEvent) {
        // No subscribers is the normal case outside of persistence and tests
        let _ = self.events.send(event);
    }
}
