//! One broker session: acquire, hand off, wait, release
//!
//! The session brackets the subordinate's execution window: the hold is
//! acquired before the subordinate runs and released exactly once after it
//! exits, on every path. Interactive interrupts are ignored while the
//! resource may be held so the release can never be skipped by an operator's
//! ^C.

use std::ffi::OsString;
use std::process::ExitStatus;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::manager::client::{RegistrationHandle, ResourceClient, ResourceError};
use crate::manager::messages::Capabilities;
use crate::subordinate::{SubordinateHandle, SubordinateSpawner, SyncError};

/// Broker-level exit codes (sysexits), distinct from any subordinate status
pub const EXIT_USAGE: i32 = 64;
pub const EXIT_UNAVAILABLE: i32 = 69;
pub const EXIT_SPAWN: i32 = 71;
pub const EXIT_DENIED: i32 = 75;
pub const EXIT_PROTOCOL: i32 = 76;

/// Errors that abort a session
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Spawn(#[from] SyncError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// The subordinate ran; the broker mirrors its exit status
    Completed(ExitStatus),
    /// The manager declined the hold; the subordinate never ran
    Denied { status: i32 },
}

/// Orchestrates one acquisition session
#[derive(Debug)]
pub struct Broker {
    config: Config,
    caps: Capabilities,
    spawner: SubordinateSpawner,
}

impl Broker {
    pub fn new(config: Config) -> Result<Self, BrokerError> {
        let caps = config
            .session
            .capability_set()
            .map_err(|e| BrokerError::Config(e.to_string()))?;
        let spawner = SubordinateSpawner::new()?;
        Ok(Self {
            config,
            caps,
            spawner,
        })
    }

    /// Spawner override (for testing)
    pub fn with_spawner(mut self, spawner: SubordinateSpawner) -> Self {
        self.spawner = spawner;
        self
    }

    /// Run one session to completion
    ///
    /// The subordinate is created first, paused; the handshake runs while it
    /// waits. On a denial the subordinate is terminated without ever running.
    /// Once acquisition succeeded the resource is released exactly once, no
    /// matter how the subordinate ends.
    pub async fn run(&self, argv: &[OsString]) -> Result<SessionOutcome, BrokerError> {
        let mut subordinate = self.spawner.spawn_paused(argv)?;

        // From here until after the release, an operator interrupt must not
        // take the broker down with the hold unreleased.
        let _interrupts = suppress_interrupts();

        let client = ResourceClient::new(&self.config.manager);
        let mut handle = match self.handshake(&client, subordinate.pid()).await {
            Ok(handle) => handle,
            Err(BrokerError::Resource(ResourceError::Denied { status })) => {
                warn!(status, "acquisition denied; subordinate will not run");
                subordinate.terminate().await?;
                return Ok(SessionOutcome::Denied { status });
            }
            Err(err) => {
                // best effort teardown before surfacing the real failure
                if let Err(kill_err) = subordinate.terminate().await {
                    warn!(error = %kill_err, "could not tear down paused subordinate");
                }
                return Err(err);
            }
        };

        let status = run_subordinate(&mut subordinate).await;

        // The one must-run cleanup: exactly one release once acquisition
        // succeeded, regardless of how the subordinate went.
        if let Err(err) = handle.release().await {
            warn!(error = %err, "release was not accepted by the transport");
        }

        let status = status?;
        info!(?status, "session complete");
        Ok(SessionOutcome::Completed(status))
    }

    async fn handshake(
        &self,
        client: &ResourceClient,
        subject_pid: u32,
    ) -> Result<RegistrationHandle, BrokerError> {
        let mut handle = client
            .register(self.caps, &self.config.session.class, self.config.session.mode)
            .await?;
        let granted = handle.acquire().await?;
        info!(granted = %granted, "resource acquired");
        handle.configure(subject_pid).await?;
        Ok(handle)
    }
}

async fn run_subordinate(subordinate: &mut SubordinateHandle) -> Result<ExitStatus, BrokerError> {
    subordinate.release()?;
    Ok(subordinate.await_exit().await?)
}

/// Drain SIGINT for the lifetime of the returned guard
///
/// The subordinate is not shielded: exec resets its dispositions, and
/// killing it directly is a legitimate way to end the session early.
fn suppress_interrupts() -> InterruptGuard {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::interrupt()) {
        Ok(mut sigint) => {
            let task = tokio::spawn(async move {
                while sigint.recv().await.is_some() {
                    warn!("interrupt ignored while the resource is held");
                }
            });
            debug!("interactive interrupts suppressed");
            InterruptGuard { task: Some(task) }
        }
        Err(e) => {
            warn!(error = %e, "could not install interrupt handler");
            InterruptGuard { task: None }
        }
    }
}

struct InterruptGuard {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
