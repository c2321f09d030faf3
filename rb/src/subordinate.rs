//! Subordinate task lifecycle: spawn paused, release once, observe exit
//!
//! The subordinate is created by re-invoking the broker binary in the hidden
//! `wait` mode with the read end of a private pipe left inheritable. The wait
//! mode blocks on a one-byte read from that pipe before doing anything else,
//! then execs the target command in place, so the pid reported to the
//! resource manager is the pid that ends up running the command and the
//! executable is resolved only after the go signal, inside the subordinate.
//! stdin/stdout/stderr pass through unmodified.

use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variable carrying the go-pipe fd number into the wait mode
pub const GO_FD_ENV: &str = "RESBROKER_GO_FD";

/// Wait-mode exit statuses for the non-exec outcomes
pub const EXIT_WAIT_USAGE: i32 = 64;
pub const EXIT_WAIT_ORPHANED: i32 = 70;
pub const EXIT_WAIT_NOEXEC: i32 = 126;
pub const EXIT_WAIT_NOTFOUND: i32 = 127;

/// Errors from subordinate management
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to spawn subordinate: {0}")]
    Spawn(String),

    #[error("subordinate already released")]
    AlreadyReleased,

    #[error("failed to signal subordinate: {0}")]
    Signal(String),

    #[error("failed to observe subordinate exit: {0}")]
    Wait(#[from] std::io::Error),
}

/// Spawns subordinates paused behind the go-pipe rendezvous
#[derive(Debug, Clone)]
pub struct SubordinateSpawner {
    shim: PathBuf,
}

impl SubordinateSpawner {
    /// Spawner re-invoking the running broker binary
    pub fn new() -> Result<Self, SyncError> {
        let shim = std::env::current_exe()
            .map_err(|e| SyncError::Spawn(format!("cannot resolve own binary: {e}")))?;
        Ok(Self { shim })
    }

    /// Spawner using an explicit broker binary (for testing)
    pub fn with_shim(shim: PathBuf) -> Self {
        Self { shim }
    }

    /// Create the subordinate, paused
    ///
    /// The child blocks reading the go pipe before any other work. An empty
    /// `argv` is valid: the subordinate exits 0 on release without executing
    /// anything, and the session still performs the full bracket.
    pub fn spawn_paused(&self, argv: &[OsString]) -> Result<SubordinateHandle, SyncError> {
        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|e| SyncError::Spawn(format!("pipe: {e}")))?;
        // The read end is deliberately inheritable; the write end must not
        // leak into the child or a dead controller could never be noticed.
        nix::fcntl::fcntl(
            &write_end,
            nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
        )
        .map_err(|e| SyncError::Spawn(format!("fcntl: {e}")))?;

        let mut cmd = Command::new(&self.shim);
        cmd.arg("wait")
            .args(argv)
            .env(GO_FD_ENV, read_end.as_raw_fd().to_string());
        let child = cmd
            .spawn()
            .map_err(|e| SyncError::Spawn(format!("{}: {e}", self.shim.display())))?;
        drop(read_end); // the child holds it now
        let pid = child
            .id()
            .ok_or_else(|| SyncError::Spawn("subordinate exited before it could be tracked".to_string()))?;
        debug!(pid, ?argv, "subordinate spawned paused");
        Ok(SubordinateHandle {
            child,
            go: Some(write_end),
            pid,
        })
    }
}

/// One paused-or-running subordinate
#[derive(Debug)]
pub struct SubordinateHandle {
    child: Child,
    go: Option<OwnedFd>,
    pid: u32,
}

impl SubordinateHandle {
    /// Pid reported to the resource manager in the configure step
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write the single go datum, unblocking the subordinate
    ///
    /// At most once per handle; a second call is [`SyncError::AlreadyReleased`].
    pub fn release(&mut self) -> Result<(), SyncError> {
        let fd = self.go.take().ok_or(SyncError::AlreadyReleased)?;
        let mut pipe = File::from(fd);
        match pipe.write_all(b"go") {
            Ok(()) => debug!(pid = self.pid, "subordinate released"),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // already dead; await_exit observes the status
                debug!(pid = self.pid, error = %e, "subordinate gone before release");
            }
            Err(e) => return Err(SyncError::Signal(e.to_string())),
        }
        Ok(())
    }

    /// Block until the subordinate terminates
    pub async fn await_exit(&mut self) -> Result<ExitStatus, SyncError> {
        let status = self.child.wait().await?;
        debug!(pid = self.pid, ?status, "subordinate exited");
        Ok(status)
    }

    /// Kill the subordinate without releasing it; the denial/abort path
    pub async fn terminate(&mut self) -> Result<(), SyncError> {
        debug!(pid = self.pid, "terminating subordinate without release");
        if let Err(e) = self.child.kill().await {
            debug!(pid = self.pid, error = %e, "subordinate already gone");
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// Entry point for the hidden `wait` mode
///
/// Blocks on the go pipe, then execs `argv` in place. This runs before
/// logging or configuration are touched: the subordinate performs no
/// observable work before the signal arrives. If the pipe closes without a
/// go signal the controller is gone and the command must never run.
pub fn wait_and_exec(argv: &[OsString]) -> i32 {
    let Some(fd) = std::env::var(GO_FD_ENV)
        .ok()
        .and_then(|v| v.parse::<RawFd>().ok())
    else {
        eprintln!("rb wait: {GO_FD_ENV} is not set; this mode is internal to the broker");
        return EXIT_WAIT_USAGE;
    };

    // Safety: the spawner created this fd for us and nothing else owns it
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    let mut go = [0u8; 1];
    match pipe.read(&mut go) {
        Ok(0) => return EXIT_WAIT_ORPHANED,
        Ok(_) => {}
        Err(e) => {
            eprintln!("rb wait: reading go pipe: {e}");
            return EXIT_WAIT_ORPHANED;
        }
    }
    drop(pipe);

    let Some(program) = argv.first() else {
        // empty command: no-op completion
        return 0;
    };

    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(program)
        .args(&argv[1..])
        .env_remove(GO_FD_ENV)
        .exec();
    eprintln!("rb wait: exec {}: {err}", program.to_string_lossy());
    if err.kind() == std::io::ErrorKind::NotFound {
        EXIT_WAIT_NOTFOUND
    } else {
        EXIT_WAIT_NOEXEC
    }
}
