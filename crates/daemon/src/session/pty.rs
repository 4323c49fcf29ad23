//! PTY process wrapper.
//!
//! This module owns the OS-level pseudo-terminal and the child process
//! attached to it. It exposes raw write and resize operations plus an
//! idempotent terminate; output is consumed through the reader handed out
//! at spawn time, where process exit surfaces as end-of-stream.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::SessionConfig;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already ended.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The process could not be created.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// PTY read/write failure. Fatal to the session.
    #[error("PTY I/O error: {0}")]
    Io(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// The manager is mid-teardown and refuses new work.
    #[error("session manager is shutting down")]
    ShutdownInProgress,

    /// The configured session cap was hit.
    #[error("session limit reached: {0} sessions")]
    LimitReached(usize),
}

/// How long terminate() waits for the child to honor SIGHUP before the
/// hard kill.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Poll interval while waiting out the termination grace period.
const TERMINATE_POLL: Duration = Duration::from_millis(50);

/// Command line, environment, and working directory for spawned sessions.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Program to run (shell path or name resolvable in PATH).
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory. None inherits the daemon's.
    pub cwd: Option<PathBuf>,
}

impl From<&SessionConfig> for SpawnSpec {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            command: cfg.shell.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            cwd: cfg.cwd.clone(),
        }
    }
}

/// One pseudo-terminal and the child process attached to it.
///
/// The wrapper's I/O handles are usable only while the process is alive;
/// `terminate` tears both down and reaps the child exactly once no matter
/// how often it is called.
pub struct PtyProcess {
    /// Session this process belongs to, for errors and logging.
    session_id: SessionId,

    /// The PTY master handle, kept for resize.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer feeding the child's stdin through the PTY.
    writer: Mutex<Box<dyn Write + Send>>,

    /// The child process handle.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Cleared when the process exits or terminate() runs.
    alive: AtomicBool,

    /// Set by the first terminate() call; later calls are no-ops.
    terminated: AtomicBool,

    /// Exit code recorded when the child is reaped.
    exit_code: std::sync::Mutex<Option<i32>>,

    /// Process ID of the child.
    pid: Option<u32>,

    /// Current terminal size.
    size: std::sync::Mutex<(u16, u16)>,
}

impl PtyProcess {
    /// Allocates a PTY pair, spawns `spec` attached to the slave side, and
    /// retains the master side for I/O.
    ///
    /// Returns the wrapper and the master-side reader. Reads on the reader
    /// block; callers are expected to drive it from a blocking task. The
    /// reader returning zero bytes means the process exited.
    pub fn spawn(
        session_id: SessionId,
        spec: &SpawnSpec,
        rows: u16,
        cols: u16,
    ) -> Result<(Self, Box<dyn std::io::Read + Send>), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        tracing::info!(
            session_id = %session_id,
            command = %spec.command,
            pid = pid,
            rows = rows,
            cols = cols,
            "Spawned PTY process"
        );

        let process = PtyProcess {
            session_id,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            exit_code: std::sync::Mutex::new(None),
            pid,
            size: std::sync::Mutex::new((rows, cols)),
        };

        Ok((process, reader))
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size as (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap()
    }

    /// Returns whether the process is still considered alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Returns the recorded exit code, if the child has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    /// Writes input bytes to the child's stdin via the PTY.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.session_id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::Io(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::Io(e.to_string()))?;

        Ok(())
    }

    /// Propagates new terminal dimensions to the kernel PTY.
    ///
    /// The kernel delivers SIGWINCH to the child as a side effect.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.session_id.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Resize(e.to_string()))?;

        *self.size.lock().unwrap() = (rows, cols);

        tracing::debug!(
            session_id = %self.session_id,
            rows = rows,
            cols = cols,
            "Resized PTY"
        );

        Ok(())
    }

    /// Terminates the child and reaps it. Idempotent: the first call does
    /// the work, every later call returns Ok without touching the process.
    ///
    /// An already-exited child is reaped without signalling. A live child
    /// gets SIGHUP first, a short grace period, then a hard kill.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.alive.store(false, Ordering::SeqCst);

        let mut child = self.child.lock().await;

        // Already exited on its own: just collect the status.
        if let Ok(Some(status)) = child.try_wait() {
            self.record_exit(status.exit_code() as i32);
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            // Hang up the controlling terminal; most shells exit cleanly.
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGHUP);

            let mut waited = Duration::ZERO;
            while waited < TERMINATE_GRACE {
                if let Ok(Some(status)) = child.try_wait() {
                    self.record_exit(status.exit_code() as i32);
                    tracing::debug!(
                        session_id = %self.session_id,
                        "Process exited on SIGHUP"
                    );
                    return Ok(());
                }
                tokio::time::sleep(TERMINATE_POLL).await;
                waited += TERMINATE_POLL;
            }
        }

        // Grace period expired (or non-unix): hard kill and reap.
        child
            .kill()
            .map_err(|e| SessionError::Io(e.to_string()))?;
        let status = child
            .wait()
            .map_err(|e| SessionError::Io(e.to_string()))?;
        self.record_exit(status.exit_code() as i32);

        tracing::info!(session_id = %self.session_id, "Process terminated");

        Ok(())
    }

    fn record_exit(&self, code: i32) {
        *self.exit_code.lock().unwrap() = Some(code);
    }
}
