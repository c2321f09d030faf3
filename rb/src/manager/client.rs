//! Client side of the resource-acquisition protocol
//!
//! Drives the ordered register -> acquire -> configure -> release exchange
//! against the manager endpoint. Register and acquire block for their
//! synchronous replies; configure and release do not gate the session on a
//! reply. A [`RegistrationHandle`] enforces the forward-only state machine
//! `Registered -> Acquired -> Released`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::messages::{self, Capabilities, MalformedReply, MessageKind, Reply, Request};
use super::Destination;
use crate::config::ManagerConfig;

/// Default timeout for each blocking protocol step
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the optional configure acknowledgement
const CONFIGURE_POLL: Duration = Duration::from_millis(200);

/// Errors from the acquisition protocol
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource manager unreachable: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    MalformedReply(#[from] MalformedReply),

    #[error("acquisition denied by resource manager (status {status})")]
    Denied { status: i32 },

    #[error("{op} is not valid once the handle is {state:?}")]
    InvalidState { op: &'static str, state: HandleState },
}

/// Forward-only session states of a registration handle
///
/// `Unregistered` exists only before the handle does; `Released` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Registered,
    Acquired,
    Released,
}

/// Connector for the resource-manager endpoint
#[derive(Debug, Clone)]
pub struct ResourceClient {
    socket_path: PathBuf,
    destination: Destination,
    timeout: Duration,
}

impl ResourceClient {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            socket_path: config.socket.clone(),
            destination: config.destination(),
            timeout: config.timeout(),
        }
    }

    /// Override the socket path (for testing)
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = socket_path;
        self
    }

    /// Set a custom per-step timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check that the endpoint accepts connections, without registering
    pub async fn probe(&self) -> Result<(), ResourceError> {
        self.connect().await.map(drop)
    }

    /// Register a session with the manager
    ///
    /// Sends `Register` and blocks for the synchronous reply. The returned
    /// handle carries the manager-assigned id for the rest of the session.
    pub async fn register(
        &self,
        caps: Capabilities,
        class: &str,
        mode: u32,
    ) -> Result<RegistrationHandle, ResourceError> {
        let stream = self.connect().await?;
        let mut handle = RegistrationHandle {
            stream,
            id: 0,
            reqno: 0,
            granted: Capabilities::empty(),
            state: HandleState::Registered,
            timeout: self.timeout,
        };

        let reqno = handle.next_reqno();
        handle
            .send(
                Request::Register {
                    caps,
                    class: class.to_string(),
                    mode,
                },
                reqno,
            )
            .await?;
        let reply = handle.recv(reqno).await?;
        if reply.kind != MessageKind::Register {
            return Err(ResourceError::Protocol(format!(
                "expected a registration reply, got {:?}",
                reply.kind
            )));
        }
        if reply.status != 0 {
            return Err(ResourceError::Protocol(format!(
                "registration refused (status {})",
                reply.status
            )));
        }
        handle.id = reply.id;
        debug!(id = handle.id, caps = %caps, class, "registered with resource manager");
        Ok(handle)
    }

    async fn connect(&self) -> Result<UnixStream, ResourceError> {
        debug!(
            socket = %self.socket_path.display(),
            service = %self.destination.service,
            object_path = %self.destination.object_path,
            "connecting to resource manager"
        );
        tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| ResourceError::Connection("connect timed out".to_string()))?
            .map_err(|e| {
                ResourceError::Connection(format!("{}: {e}", self.socket_path.display()))
            })
    }
}

/// One registered session with the manager
///
/// Owns the connection; requests carry a strictly increasing sequence
/// number. All operations error once the handle is `Released`.
#[derive(Debug)]
pub struct RegistrationHandle {
    stream: UnixStream,
    id: u32,
    reqno: u32,
    granted: Capabilities,
    state: HandleState,
    timeout: Duration,
}

impl RegistrationHandle {
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Capability subset granted by the manager (empty until acquired)
    pub fn granted(&self) -> Capabilities {
        self.granted
    }

    /// Ask the manager for the hold
    ///
    /// Blocks for the `Grant` reply. A non-zero status or an empty granted
    /// set is a denial; denials are not retried here.
    pub async fn acquire(&mut self) -> Result<Capabilities, ResourceError> {
        self.expect_state("acquire", HandleState::Registered)?;
        let reqno = self.next_reqno();
        self.send(Request::Acquire, reqno).await?;
        let reply = self.recv(reqno).await?;
        if reply.kind != MessageKind::Grant {
            return Err(ResourceError::Protocol(format!(
                "expected a grant reply, got {:?}",
                reply.kind
            )));
        }
        if reply.status != 0 || reply.granted.is_empty() {
            return Err(ResourceError::Denied {
                status: reply.status,
            });
        }
        self.granted = reply.granted;
        self.state = HandleState::Acquired;
        debug!(granted = %reply.granted, "resource hold granted");
        Ok(reply.granted)
    }

    /// Attribute the hold to the subordinate's pid
    ///
    /// Sent without gating the session on a reply; an acknowledgement is
    /// inspected opportunistically and a refusal is logged, not fatal.
    pub async fn configure(&mut self, subject_pid: u32) -> Result<(), ResourceError> {
        self.expect_state("configure", HandleState::Acquired)?;
        let reqno = self.next_reqno();
        self.send(Request::Video { pid: subject_pid }, reqno).await?;

        match tokio::time::timeout(CONFIGURE_POLL, messages::read_frame(&mut self.stream)).await {
            Ok(Ok(payload)) => match messages::decode_reply(&payload) {
                Ok(reply) if reply.status != 0 => {
                    warn!(status = reply.status, "manager refused pid attribution");
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring unparseable configure reply"),
            },
            Ok(Err(e)) => debug!(error = %e, "no configure reply readable"),
            Err(_) => debug!("no configure reply within poll window"),
        }
        debug!(subject_pid, "session configured");
        Ok(())
    }

    /// Send the final `Release`
    ///
    /// No reply is awaited. The handle moves to its terminal state even if
    /// the send fails; a second release is a defined error, never undefined
    /// behavior.
    pub async fn release(&mut self) -> Result<(), ResourceError> {
        if self.state == HandleState::Released {
            return Err(ResourceError::InvalidState {
                op: "release",
                state: self.state,
            });
        }
        let reqno = self.next_reqno();
        let sent = self.send(Request::Release, reqno).await;
        self.state = HandleState::Released;
        debug!("resource hold released");
        sent
    }

    fn expect_state(&self, op: &'static str, expected: HandleState) -> Result<(), ResourceError> {
        if self.state != expected {
            return Err(ResourceError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn next_reqno(&mut self) -> u32 {
        self.reqno += 1;
        self.reqno
    }

    async fn send(&mut self, request: Request, reqno: u32) -> Result<(), ResourceError> {
        let payload = messages::encode_request(&request, self.id, reqno);
        tokio::time::timeout(self.timeout, messages::write_frame(&mut self.stream, &payload))
            .await
            .map_err(|_| ResourceError::Connection("write timed out".to_string()))?
            .map_err(|e| ResourceError::Connection(format!("write failed: {e}")))?;
        debug!(kind = ?request.kind(), reqno, "request sent");
        Ok(())
    }

    async fn recv(&mut self, reqno: u32) -> Result<Reply, ResourceError> {
        let payload = tokio::time::timeout(self.timeout, messages::read_frame(&mut self.stream))
            .await
            .map_err(|_| ResourceError::Connection("reply timed out".to_string()))?
            .map_err(|e| ResourceError::Connection(format!("read failed: {e}")))?;
        let reply = messages::decode_reply(&payload)?;
        if reply.reqno != reqno {
            return Err(MalformedReply(format!(
                "reply for reqno {} while waiting for {}",
                reply.reqno, reqno
            ))
            .into());
        }
        debug!(kind = ?reply.kind, reqno, status = reply.status, "reply received");
        Ok(reply)
    }
}
