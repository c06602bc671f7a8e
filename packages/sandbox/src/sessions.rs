// ABOUTME: Registry of in-flight command sessions and their stream handles
// ABOUTME: Sole owner of stream cancellation so aborts can race completion safely

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Stream for session {0} was already destroyed")]
    AlreadyDestroyed(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Capacity of the ended-session channel
pub const DEFAULT_ENDED_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Error,
    Aborted,
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Destroy capability for a live exec stream.
///
/// Destroying cancels the paired [`AbortSignal`]; a second destroy is an error.
#[derive(Debug)]
pub struct StreamHandle {
    label: String,
    token: CancellationToken,
    destroyed: AtomicBool,
}

/// Observer side of a [`StreamHandle`], held by whoever pumps the stream
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl StreamHandle {
    pub fn new(label: impl Into<String>) -> (Self, AbortSignal) {
        let token = CancellationToken::new();
        let signal = AbortSignal {
            token: token.clone(),
        };
        let handle = Self {
            label: label.into(),
            token,
            destroyed: AtomicBool::new(false),
        };
        (handle, signal)
    }

    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyDestroyed(self.label.clone()));
        }
        self.token.cancel();
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl AbortSignal {
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// What a caller asked to run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    /// Names of the variables passed to the command; values are never kept
    pub env_keys: Vec<String>,
    pub timeout: Option<Duration>,
}

impl SessionInfo {
    /// Sorted key list for an environment map
    pub fn env_keys_of<'a>(env: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut keys: Vec<String> = env.into_iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub info: SessionInfo,
    pub sandbox_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    stream_handle: Option<StreamHandle>,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.info.user_id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            command: self.info.command.clone(),
            env_keys: self.info.env_keys.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            has_stream: self.stream_handle.is_some(),
        }
    }
}

/// Cloneable view of a session without its stream handle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub sandbox_id: Option<String>,
    pub command: Vec<String>,
    pub env_keys: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub has_stream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub sandbox_id: Option<String>,
}

pub struct SessionTable {
    sessions: RwLock<HashMap<String, Session>>,
    ended: broadcast::Sender<SessionSnapshot>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        let (ended, _) = broadcast::channel(DEFAULT_ENDED_CHANNEL_SIZE);
        Self {
            sessions: RwLock::new(HashMap::new()),
            ended,
        }
    }

    /// Subscribe to sessions as they leave the table, with their final status
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.ended.subscribe()
    }

    fn announce_end(&self, session: &Session) {
        let _ = self.ended.send(session.snapshot());
    }

    pub async fn create(&self, session_id: &str, info: SessionInfo) -> Result<SessionSnapshot> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }
        let session = Session {
            session_id: session_id.to_string(),
            info,
            sandbox_id: None,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Running,
            stream_handle: None,
        };
        let snapshot = session.snapshot();
        sessions.insert(session_id.to_string(), session);
        debug!("Registered session {}", session_id);
        Ok(snapshot)
    }

    pub async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<SessionSnapshot> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if let Some(sandbox_id) = patch.sandbox_id {
            session.sandbox_id = Some(sandbox_id);
        }
        if let Some(status) = patch.status {
            session.status = status;
            if status.is_finished() && session.end_time.is_none() {
                session.end_time = Some(Utc::now());
            }
        }
        Ok(session.snapshot())
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().await.get(session_id).map(Session::snapshot)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Record a final status and drop the session.
    ///
    /// Returns `None` when the session is already gone, which means it was
    /// aborted first.
    pub async fn finish(&self, session_id: &str, status: SessionStatus) -> Option<SessionSnapshot> {
        let mut session = self.sessions.write().await.remove(session_id)?;
        session.status = status;
        session.end_time.get_or_insert_with(Utc::now);
        session.stream_handle = None;

        self.announce_end(&session);
        Some(session.snapshot())
    }

    /// Hand the live stream's destroy capability to the table.
    ///
    /// Fails if the session is gone, which means it was aborted first.
    pub async fn attach_stream(&self, session_id: &str, handle: StreamHandle) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if let Some(previous) = session.stream_handle.replace(handle) {
            if let Err(e) = previous.destroy() {
                debug!("Replaced stream for {}: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// Abort a session: mark it aborted, destroy its stream and drop it.
    ///
    /// Returns false for unknown ids.
    pub async fn abort(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        let Some(mut session) = removed else {
            debug!("Abort requested for unknown session {}", session_id);
            return false;
        };

        session.status = SessionStatus::Aborted;
        session.end_time = Some(Utc::now());

        if let Some(handle) = session.stream_handle.take() {
            if let Err(e) = handle.destroy() {
                warn!("Ignoring stream destroy failure for {}: {}", session_id, e);
            }
        }

        info!(
            "Aborted session {} for user {}",
            session_id, session.info.user_id
        );
        self.announce_end(&session);
        true
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .values()
            .map(Session::snapshot)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
