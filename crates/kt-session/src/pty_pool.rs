//! Local PTY exec transport.
//!
//! Used by the local development backend: instead of exec'ing into a
//! container, the shell runs on this host in a pseudo-terminal, with the
//! working directory configured for the pod.

use std::collections::{HashMap, HashSet};
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kt_core::types::{ContainerRef, ObjectKey};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{ExecError, ExecTransport, StreamIo};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty pool is at capacity ({max})")]
    AtCapacity { max: usize },

    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

// ---------------------------------------------------------------------------
// PtyHandle
// ---------------------------------------------------------------------------

/// One process running in a PTY, with its output and input as channels.
pub struct PtyHandle {
    pub id: Uuid,
    pub output: flume::Receiver<Vec<u8>>,
    pub input: flume::Sender<Vec<u8>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
}

impl PtyHandle {
    pub fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("child lock was poisoned, recovering");
            e.into_inner()
        });
        child
            .kill()
            .map_err(|e| PtyError::Internal(e.to_string()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| {
            warn!("master lock was poisoned, recovering");
            e.into_inner()
        });
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Internal(format!("resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Wait for the child to exit and return its exit code.
    pub async fn wait(&self) -> Result<u32> {
        let child = self.child.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
            child.wait()
        })
        .await
        .map_err(|e| PtyError::Internal(e.to_string()))?
        .map(|status| status.exit_code())
        .map_err(|e| PtyError::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// PtyPool
// ---------------------------------------------------------------------------

/// Spawns processes in PTYs up to a fixed number at a time.
pub struct PtyPool {
    max_ptys: usize,
    active: Mutex<HashSet<Uuid>>,
}

impl PtyPool {
    pub fn new(max_ptys: usize) -> Self {
        info!(max_ptys, "creating PtyPool");
        Self {
            max_ptys,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.active.lock().unwrap_or_else(|e| {
            warn!("PtyPool lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Spawn `command` in a new PTY of the given size.
    pub fn spawn(
        &self,
        command: &[String],
        cwd: Option<&PathBuf>,
        size: PtySize,
    ) -> Result<PtyHandle> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| PtyError::SpawnFailed("empty command".into()))?;

        let id = self.reserve()?;
        self.start(id, program, args, cwd, size).inspect_err(|_| self.release(id))
    }

    /// Claim a slot under a single lock so concurrent spawns cannot overshoot.
    fn reserve(&self) -> Result<Uuid> {
        let mut active = self.lock_active();
        if active.len() >= self.max_ptys {
            return Err(PtyError::AtCapacity { max: self.max_ptys });
        }
        let id = Uuid::new_v4();
        active.insert(id);
        Ok(id)
    }

    fn start(
        &self,
        id: Uuid,
        program: &str,
        args: &[String],
        cwd: Option<&PathBuf>,
        size: PtySize,
    ) -> Result<PtyHandle> {
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        builder.env("TERM", "xterm");
        if let Some(dir) = cwd {
            builder.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        // The slave must be dropped so the reader sees EOF when the child exits.
        drop(pair.slave);
        debug!(%program, ?args, "spawned PTY process");

        let (out_tx, out_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Linux reports EIO once the child side is gone.
                        debug!("pty reader finished: {e}");
                        break;
                    }
                }
            }
        });

        let (in_tx, in_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        std::thread::spawn(move || {
            while let Ok(data) = in_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(PtyHandle {
            id,
            output: out_rx,
            input: in_tx,
            child: Arc::new(Mutex::new(child)),
            master: Arc::new(Mutex::new(pair.master)),
        })
    }

    pub fn release(&self, id: Uuid) {
        self.lock_active().remove(&id);
    }
}

// ---------------------------------------------------------------------------
// LocalPtyTransport
// ---------------------------------------------------------------------------

/// Runs commands on this host in a PTY.
pub struct LocalPtyTransport {
    pool: PtyPool,
    workdirs: HashMap<ObjectKey, PathBuf>,
    eof_grace: Duration,
}

impl LocalPtyTransport {
    pub fn new(max_ptys: usize, eof_grace: Duration) -> Self {
        Self {
            pool: PtyPool::new(max_ptys),
            workdirs: HashMap::new(),
            eof_grace,
        }
    }

    /// Start shells for `pod` in `dir`.
    pub fn with_workdir(mut self, pod: ObjectKey, dir: PathBuf) -> Self {
        self.workdirs.insert(pod, dir);
        self
    }

    pub fn pool(&self) -> &PtyPool {
        &self.pool
    }
}

#[async_trait]
impl ExecTransport for LocalPtyTransport {
    async fn stream(
        &self,
        target: &ContainerRef,
        command: &[String],
        io: &StreamIo,
    ) -> std::result::Result<(), ExecError> {
        let size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };
        let handle = self
            .pool
            .spawn(command, self.workdirs.get(&target.pod_key()), size)
            .map_err(|e| match e {
                PtyError::AtCapacity { .. } => ExecError::Transport(e.to_string()),
                other => ExecError::start_failed(command, other.to_string()),
            })?;
        info!(%target, pty_id = %handle.id, ?command, "local shell started");

        let result = pump(&handle, io, self.eof_grace).await;
        self.pool.release(handle.id);
        result
    }
}

async fn pump(
    handle: &PtyHandle,
    io: &StreamIo,
    eof_grace: Duration,
) -> std::result::Result<(), ExecError> {
    let output = async {
        while let Ok(chunk) = handle.output.recv_async().await {
            io.stdout.write_stdout(&chunk).await?;
        }
        Ok::<_, ExecError>(())
    };

    let input = async {
        loop {
            let outcome = io.stdin.read_stdin().await;
            let bytes = outcome.bytes();
            if !bytes.is_empty() && handle.input.send_async(bytes.to_vec()).await.is_err() {
                break;
            }
            if outcome.is_end() {
                break;
            }
        }
        tokio::time::sleep(eof_grace).await;
    };

    let sizes = async {
        while let Some(size) = io.sizes.next_size().await {
            if let Err(e) = handle.resize(size.cols, size.rows) {
                warn!(pty_id = %handle.id, error = %e, "resize failed");
            }
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        finished = output => {
            if let Err(e) = finished {
                let _ = handle.kill();
                return Err(e);
            }
        }
        _ = input => {
            debug!(pty_id = %handle.id, "input ended, stopping local shell");
            let _ = handle.kill();
            let _ = handle.wait().await;
            return Ok(());
        }
        _ = sizes => {}
    }

    match handle.wait().await {
        Ok(0) => Ok(()),
        Ok(code) => Err(ExecError::NonZeroExit { code: code as i32 }),
        Err(e) => Err(ExecError::Transport(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
