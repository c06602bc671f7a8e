// ABOUTME: Streams command output from a user's sandbox with timeout and abort support
// ABOUTME: Demultiplexes exec output, forwards stdout in order and classifies fatal stderr

use crate::manager::{ManagerError, SandboxManager};
use crate::protocol::{EventSink, OutboundEvent, ProtocolTranslator, SessionState};
use crate::providers::{demux, ExecRequest, ProviderError};
use crate::sessions::{
    SessionError, SessionInfo, SessionPatch, SessionStatus, SessionTable, StreamHandle,
};
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Session {session_id} timed out after {timeout:?}")]
    Timeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("Execution failed in session {session_id}: {stderr}")]
    ExecutionFailed { session_id: String, stderr: String },

    #[error("Output stream for session {session_id} failed: {source}")]
    Stream {
        session_id: String,
        source: ProviderError,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub session_id: String,
    pub user_id: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env_vars: HashMap<String, String>,
    /// `None` uses the executor default; zero waits forever
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub session_id: String,
    pub output: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub exited_cleanly: bool,
    pub aborted: bool,
}

impl RunOutcome {
    fn aborted(session_id: &str, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            session_id: session_id.to_string(),
            output: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_code: None,
            exited_cleanly: false,
            aborted: true,
        }
    }
}

const FAILURE_PATTERNS: &[&str] = &[
    // uncaught exceptions and unhandled rejections
    r"(?i)\buncaught\s+\w*(exception|error)",
    r"(?i)\bunhandled\s+\w*(rejection|exception|error)",
    // stack frames
    r"^\s+at\s+\S+.*(\(.*:\d+(:\d+)?\)|:\d+:\d+)\s*$",
    r"^Traceback \(most recent call last\):",
    r"^thread '.*' panicked at",
    // forced exit
    r"(?i)\bforced exit\b",
    r"\bSIGKILL\b",
];

/// Best-effort detector for fatal errors reported on stderr.
///
/// Lines carrying the instrumentation debug prefix are never considered.
#[derive(Debug, Clone)]
pub struct StderrClassifier {
    patterns: Vec<Regex>,
    debug_prefix: String,
}

impl StderrClassifier {
    pub fn new(debug_prefix: impl Into<String>) -> Self {
        let patterns = FAILURE_PATTERNS
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping invalid stderr pattern {}: {}", pattern, e);
                    None
                }
            })
            .collect();
        Self {
            patterns,
            debug_prefix: debug_prefix.into(),
        }
    }

    /// First stderr line that looks fatal
    pub fn first_match<'a>(&self, stderr: &'a str) -> Option<&'a str> {
        stderr
            .lines()
            .filter(|line| {
                self.debug_prefix.is_empty() || !line.trim_start().starts_with(&self.debug_prefix)
            })
            .find(|line| self.patterns.iter().any(|re| re.is_match(line)))
    }

    pub fn is_failure(&self, stderr: &str) -> bool {
        self.first_match(stderr).is_some()
    }
}

pub struct StreamExecutor {
    manager: Arc<SandboxManager>,
    sessions: Arc<SessionTable>,
    classifier: StderrClassifier,
    translator: ProtocolTranslator,
    default_timeout: Option<Duration>,
}

impl StreamExecutor {
    pub fn new(manager: Arc<SandboxManager>, sessions: Arc<SessionTable>) -> Self {
        let settings = manager.settings();
        let classifier = StderrClassifier::new(settings.debug_log_prefix.clone());
        let translator = ProtocolTranslator::new(settings.context_window);
        let default_timeout = settings.exec_timeout;
        Self {
            manager,
            sessions,
            classifier,
            translator,
            default_timeout,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match requested {
            Some(timeout) => (!timeout.is_zero()).then_some(timeout),
            None => self.default_timeout.filter(|t| !t.is_zero()),
        }
    }

    async fn finish_session(&self, session_id: &str, status: SessionStatus) {
        match self.sessions.finish(session_id, status).await {
            Some(snapshot) => {
                let elapsed = snapshot
                    .end_time
                    .map(|end| (end - snapshot.start_time).num_milliseconds())
                    .unwrap_or_default();
                debug!(
                    "Session {} finished as {:?} after {}ms",
                    session_id, status, elapsed
                );
            }
            None => debug!("Session {} already gone", session_id),
        }
    }

    /// Run a command in the user's sandbox, forwarding each stdout chunk to
    /// `sink` in arrival order.
    pub async fn run(
        &self,
        request: RunRequest,
        sink: &mpsc::UnboundedSender<Bytes>,
    ) -> Result<RunOutcome> {
        let RunRequest {
            session_id,
            user_id,
            command,
            working_dir,
            env_vars,
            timeout,
        } = request;
        let timeout = self.effective_timeout(timeout);

        self.sessions
            .create(
                &session_id,
                SessionInfo {
                    user_id: user_id.clone(),
                    command: command.clone(),
                    working_dir: working_dir.clone(),
                    env_keys: SessionInfo::env_keys_of(env_vars.keys()),
                    timeout,
                },
            )
            .await?;

        info!(
            "Running session {} for user {}: {:?}",
            session_id, user_id, command
        );

        let exec_request = ExecRequest {
            command,
            working_dir,
            env_vars,
        };
        let (stream, handle) = match self.manager.exec_in_container(&user_id, &exec_request).await {
            Ok(started) => started,
            Err(e) => {
                if !self.sessions.contains(&session_id).await {
                    info!("Session {} aborted while its sandbox was starting", session_id);
                    return Ok(RunOutcome::aborted(&session_id, &[], &[]));
                }
                self.finish_session(&session_id, SessionStatus::Error).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .sessions
            .update(
                &session_id,
                SessionPatch {
                    sandbox_id: Some(handle.sandbox_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            debug!("Could not record sandbox for {}: {}", session_id, e);
        }

        let (stream_handle, signal) = StreamHandle::new(session_id.clone());
        if self
            .sessions
            .attach_stream(&session_id, stream_handle)
            .await
            .is_err()
        {
            info!("Session {} aborted before its stream attached", session_id);
            return Ok(RunOutcome::aborted(&session_id, &[], &[]));
        }

        let exec_id = stream.exec_id.clone();
        let mut demuxed = demux(stream.output);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (mut stdout_open, mut stderr_open) = (true, true);

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        while stdout_open || stderr_open {
            tokio::select! {
                biased;

                _ = signal.cancelled() => break,

                _ = &mut deadline => {
                    demuxed.shutdown().await;
                    self.sessions.abort(&session_id).await;
                    let timeout = timeout.unwrap_or_default();
                    warn!("Session {} timed out after {:?}", session_id, timeout);
                    return Err(ExecutorError::Timeout { session_id, timeout });
                }

                chunk = demuxed.stdout.recv(), if stdout_open => match chunk {
                    Some(data) => {
                        stdout.extend_from_slice(&data);
                        if sink.send(data).is_err() {
                            debug!("Output sink for {} closed", session_id);
                        }
                    }
                    None => stdout_open = false,
                },

                chunk = demuxed.stderr.recv(), if stderr_open => match chunk {
                    Some(data) => stderr.extend_from_slice(&data),
                    None => stderr_open = false,
                },
            }
        }

        if signal.is_cancelled() || !self.sessions.contains(&session_id).await {
            demuxed.shutdown().await;
            info!("Session {} was aborted", session_id);
            return Ok(RunOutcome::aborted(&session_id, &stdout, &stderr));
        }

        if let Err(source) = demuxed.finish().await {
            self.finish_session(&session_id, SessionStatus::Error).await;
            return Err(ExecutorError::Stream { session_id, source });
        }

        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        if let Some(line) = self.classifier.first_match(&stderr) {
            warn!("Session {} reported a fatal error: {}", session_id, line);
            self.finish_session(&session_id, SessionStatus::Error).await;
            return Err(ExecutorError::ExecutionFailed { session_id, stderr });
        }

        let exit_code = self.manager.exec_exit_code(&exec_id).await;
        self.finish_session(&session_id, SessionStatus::Completed)
            .await;

        Ok(RunOutcome {
            session_id,
            output: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            exit_code,
            exited_cleanly: exit_code.map_or(true, |code| code == 0),
            aborted: false,
        })
    }

    /// Run a command and translate its stdout into protocol events.
    ///
    /// Failures that end the run before the agent reported completion are
    /// surfaced as one `error` event as well as returned.
    pub async fn run_translated(
        &self,
        request: RunRequest,
        events: &mut dyn EventSink,
        external_session_id: Option<String>,
    ) -> Result<RunOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = SessionState::new(external_session_id);

        let run = async move {
            let tx = tx;
            self.run(request, &tx).await
        };
        let (result, ()) = tokio::join!(run, self.translator.pump(rx, &mut *events, &mut state));

        if let Err(e) = &result {
            if !state.finished {
                events.emit(OutboundEvent::Error {
                    session_id: state.session_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }
}
