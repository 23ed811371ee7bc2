//! The seam between a session and the process it drives.
//!
//! An [`ExecTransport`] never sees a [`TerminalSession`] directly; it gets a
//! [`StreamIo`] bundling three single-method capabilities. Any connection
//! type can back them, which is how tests substitute scripted streams.

use std::sync::Arc;

use async_trait::async_trait;
use kt_core::types::ContainerRef;
use thiserror::Error;
use tracing::{info, warn};

use crate::protocol::TerminalSize;
use crate::session::{ReadOutcome, SessionError, TerminalSession};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Input for the remote process's stdin.
#[async_trait]
pub trait StdinSource: Send + Sync {
    async fn read_stdin(&self) -> ReadOutcome;
}

/// Destination for the remote process's output.
#[async_trait]
pub trait StdoutSink: Send + Sync {
    async fn write_stdout(&self, data: &[u8]) -> Result<usize, SessionError>;
}

/// Stream of terminal sizes; `None` ends it.
#[async_trait]
pub trait SizeSource: Send + Sync {
    async fn next_size(&self) -> Option<TerminalSize>;
}

#[async_trait]
impl StdinSource for TerminalSession {
    async fn read_stdin(&self) -> ReadOutcome {
        self.read_frame().await
    }
}

#[async_trait]
impl StdoutSink for TerminalSession {
    async fn write_stdout(&self, data: &[u8]) -> Result<usize, SessionError> {
        self.write_frame(data).await
    }
}

#[async_trait]
impl SizeSource for TerminalSession {
    async fn next_size(&self) -> Option<TerminalSize> {
        TerminalSession::next_size(self).await
    }
}

/// The streams handed to an exec transport.
#[derive(Clone)]
pub struct StreamIo {
    pub stdin: Arc<dyn StdinSource>,
    pub stdout: Arc<dyn StdoutSink>,
    pub sizes: Arc<dyn SizeSource>,
}

impl StreamIo {
    /// Wire all three capabilities to one session. Stderr is merged into
    /// stdout, as it is on a TTY.
    pub fn from_session(session: &Arc<TerminalSession>) -> Self {
        Self {
            stdin: session.clone(),
            stdout: session.clone(),
            sizes: session.clone(),
        }
    }
}

impl std::fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIo").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExecTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecError {
    /// The command could not be started at all (missing binary, rejected
    /// exec request). The only error that moves on to the next shell.
    #[error("failed to start '{command}': {reason}")]
    StartFailed { command: String, reason: String },

    #[error("command exited with status {code}")]
    NonZeroExit { code: i32 },

    #[error("exec transport error: {0}")]
    Transport(String),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl ExecError {
    pub fn start_failed(command: &[String], reason: impl Into<String>) -> Self {
        ExecError::StartFailed {
            command: command.join(" "),
            reason: reason.into(),
        }
    }
}

/// Runs a command in a container with a TTY and pumps its streams.
///
/// `stream` returns when the process exits or the streams end. An
/// implementation drives the stdin, stdout and size capabilities
/// concurrently and must hand the end-of-transmission bytes of a final
/// [`ReadOutcome::End`] to the process.
#[async_trait]
pub trait ExecTransport: Send + Sync {
    async fn stream(
        &self,
        target: &ContainerRef,
        command: &[String],
        io: &StreamIo,
    ) -> Result<(), ExecError>;
}

/// Run the first shell in `shells` that starts.
///
/// Only [`ExecError::StartFailed`] moves on to the next shell; any other
/// outcome, including a non-zero exit, is final. Returns the shell that ran.
pub async fn exec_with_fallback(
    transport: &dyn ExecTransport,
    target: &ContainerRef,
    shells: &[String],
    io: &StreamIo,
) -> Result<String, ExecError> {
    let mut last_error = ExecError::Transport("no shell configured".into());
    for shell in shells {
        let command = vec![shell.clone()];
        match transport.stream(target, &command, io).await {
            Ok(()) => {
                info!(%target, %shell, "shell session finished");
                return Ok(shell.clone());
            }
            Err(e @ ExecError::StartFailed { .. }) => {
                warn!(%target, %shell, error = %e, "shell failed to start, trying next");
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}
