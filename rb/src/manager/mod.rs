//! Resource-manager endpoint: addressing, wire codec, and client
//!
//! The manager is reached over a Unix domain socket. The bus destination
//! triple (service name, object path, interface) is carried in configuration
//! for addressing parity with the message-bus schema and logged at connect
//! time; the socket path is the effective address.

use std::path::PathBuf;

pub mod client;
pub mod messages;

pub use client::{HandleState, RegistrationHandle, ResourceClient, ResourceError};
pub use messages::{Capabilities, MalformedReply, MessageKind, Reply, Request};

/// Default destination triple of the manager endpoint
pub const DEFAULT_SERVICE: &str = "org.resource.Manager1";
pub const DEFAULT_OBJECT_PATH: &str = "/org/resource/Manager1";
pub const DEFAULT_INTERFACE: &str = "org.resource.Manager1";

/// Bus destination triple identifying the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub service: String,
    pub object_path: String,
    pub interface: String,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            object_path: DEFAULT_OBJECT_PATH.to_string(),
            interface: DEFAULT_INTERFACE.to_string(),
        }
    }
}

/// Get the default socket path of the resource manager
///
/// Uses the runtime directory with the same fallback chain as the broker's
/// own state files.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("resource-manager")
        .join("manager.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_manager_sock() {
        let path = default_socket_path();
        assert!(path.ends_with("resource-manager/manager.sock"));
    }

    #[test]
    fn test_default_destination_triple() {
        let dest = Destination::default();
        assert_eq!(dest.service, dest.interface);
        assert!(dest.object_path.starts_with('/'));
    }
}
