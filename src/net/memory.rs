//! In-process memory transport
//!
//! A hub routes address strings to listener queues; dialing creates a pair
//! of channel-backed connections. No sockets, no framing — objects move as
//! values. An address can be registered under any identity, which is how
//! tests exercise the outbox identity hand-off.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;

use crate::identity::PublicKey;
use crate::net::{Connection, NetError, Transport};
use crate::object::Object;

/// Per-connection object buffer.
const CONNECTION_BUFFER: usize = 64;

/// Inbound connection queue per transport.
const INCOMING_BUFFER: usize = 32;

#[derive(Clone)]
struct Listener {
    key: PublicKey,
    tx: mpsc::Sender<Arc<dyn Connection>>,
}

/// The shared hub all memory transports dial through.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: RwLock<HashMap<String, Listener>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport for `key`, listening on `addresses`.
    pub async fn transport(
        self: &Arc<Self>,
        key: PublicKey,
        addresses: Vec<String>,
    ) -> Arc<MemoryTransport> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        let transport = Arc::new(MemoryTransport {
            network: Arc::clone(self),
            local_key: key,
            incoming_tx,
            incoming: Mutex::new(incoming_rx),
        });
        for address in addresses {
            transport.listen_on(address).await;
        }
        transport
    }
}

/// One node's view of the memory network.
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local_key: PublicKey,
    incoming_tx: mpsc::Sender<Arc<dyn Connection>>,
    incoming: Mutex<mpsc::Receiver<Arc<dyn Connection>>>,
}

impl MemoryTransport {
    pub fn local_key(&self) -> PublicKey {
        self.local_key
    }

    /// Register an address routing to this transport.
    ///
    /// Last registration wins, so a test can deliberately park a different
    /// identity behind an address another node believes it knows.
    pub async fn listen_on(&self, address: impl Into<String>) {
        let address = address.into();
        let mut listeners = self.network.listeners.write().await;
        listeners.insert(
            address,
            Listener {
                key: self.local_key,
                tx: self.incoming_tx.clone(),
            },
        );
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, NetError> {
        let listener = {
            let listeners = self.network.listeners.read().await;
            listeners
                .get(address)
                .cloned()
                .ok_or_else(|| NetError::UnknownAddress(address.to_string()))?
        };

        let (out_tx, out_rx) = mpsc::channel(CONNECTION_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(CONNECTION_BUFFER);

        let local_side: Arc<dyn Connection> = Arc::new(MemoryConnection {
            remote_key: listener.key,
            tx: Mutex::new(Some(out_tx)),
            rx: Mutex::new(in_rx),
        });
        let remote_side: Arc<dyn Connection> = Arc::new(MemoryConnection {
            remote_key: self.local_key,
            tx: Mutex::new(Some(in_tx)),
            rx: Mutex::new(out_rx),
        });

        listener
            .tx
            .send(remote_side)
            .await
            .map_err(|_| NetError::DialFailed("listener shut down".to_string()))?;

        trace!(address, remote = %listener.key, "memory dial established");
        Ok(local_side)
    }

    async fn accept(&self) -> Option<Arc<dyn Connection>> {
        self.incoming.lock().await.recv().await
    }
}

/// One side of a channel-backed connection pair.
pub struct MemoryConnection {
    remote_key: PublicKey,
    tx: Mutex<Option<mpsc::Sender<Object>>>,
    rx: Mutex<mpsc::Receiver<Object>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("remote_key", &self.remote_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn remote_key(&self) -> PublicKey {
        self.remote_key
    }

    async fn write_object(&self, object: &Object) -> Result<(), NetError> {
        let tx = {
            let guard = self.tx.lock().await;
            guard.clone().ok_or(NetError::ConnectionClosed)?
        };
        tx.send(object.clone())
            .await
            .map_err(|_| NetError::ConnectionClosed)
    }

    async fn read_object(&self) -> Result<Object, NetError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetError::ConnectionClosed)
    }

    async fn close(&self) {
        self.tx.lock().await.take();
        self.rx.lock().await.close();
    }
}
