//! Connection seam
//!
//! Low-level connection establishment (dialing, listening, handshake,
//! framing) is an external collaborator. The exchange only needs two
//! traits: a `Transport` that dials addresses and yields inbound
//! connections, and a `Connection` that moves whole objects and knows the
//! verified identity of its remote end.
//!
//! `memory` provides the in-process implementation used by tests and
//! simulations.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::identity::PublicKey;
use crate::object::Object;

/// Transport-level error
#[derive(Debug, Clone)]
pub enum NetError {
    /// No route to the address
    UnknownAddress(String),
    /// Dial failed
    DialFailed(String),
    /// Connection is closed
    ConnectionClosed,
    /// Read or write failed
    Io(String),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::UnknownAddress(a) => write!(f, "unknown address: {}", a),
            NetError::DialFailed(e) => write!(f, "dial failed: {}", e),
            NetError::ConnectionClosed => write!(f, "connection closed"),
            NetError::Io(e) => write!(f, "connection i/o failed: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

/// An established point-to-point connection.
///
/// The remote identity is verified by the connection layer during the
/// handshake; everything above trusts `remote_key`.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Verified identity of the remote end.
    fn remote_key(&self) -> PublicKey;

    /// Write one object as a frame.
    async fn write_object(&self, object: &Object) -> Result<(), NetError>;

    /// Read the next object frame. Blocks until a frame arrives or the
    /// connection closes.
    async fn read_object(&self) -> Result<Object, NetError>;

    /// Close the connection. Further reads and writes fail on both ends.
    async fn close(&self);
}

/// Dialing and listening.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial an address, returning a connection with a verified remote
    /// identity. The identity is whoever actually answers at the address,
    /// which need not be who the caller expected.
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, NetError>;

    /// Wait for the next inbound connection. Returns `None` once the
    /// transport is shut down.
    async fn accept(&self) -> Option<Arc<dyn Connection>>;
}
