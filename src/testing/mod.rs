//! Test and simulation helpers
//!
//! `TestNetwork` wires full nodes (identity, exchange, discoverer) over
//! the in-process memory transport so multi-node behavior can be driven
//! from a single test. The failing transports exist for exercising the
//! outbox retry and deadline paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::discovery::{Hyperspace, ProximityStore};
use crate::exchange::{Exchange, ExchangeConfig};
use crate::identity::{Fingerprint, LocalPeer, PublicKey};
use crate::net::memory::{MemoryNetwork, MemoryTransport};
use crate::net::{Connection, NetError, Transport};
use crate::store::{MemoryObjectStore, ObjectStore};

/// Opt-in log output for tests, driven by `RUST_LOG`. Safe to call from
/// every test; only the first call installs a subscriber.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A set of full nodes sharing one memory network.
pub struct TestNetwork {
    hub: Arc<MemoryNetwork>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            hub: MemoryNetwork::new(),
        }
    }

    pub fn hub(&self) -> &Arc<MemoryNetwork> {
        &self.hub
    }

    /// Start a full node with a seeded identity, listening on its own
    /// address, bootstrapped against the given addresses.
    pub async fn node(&self, seed: u8, bootstrap: &[String]) -> TestNode {
        let address = format!("mem:{:02x}", seed);
        let local = Arc::new(LocalPeer::from_seed(seed, vec![address.clone()]));
        let transport = self
            .hub
            .transport(local.public_key(), vec![address.clone()])
            .await;
        let store = Arc::new(ProximityStore::new());
        let objects = Arc::new(MemoryObjectStore::new());

        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let dyn_objects: Arc<dyn ObjectStore> = objects.clone();
        let exchange = Exchange::start(
            Arc::clone(&local),
            dyn_transport,
            Arc::clone(&store),
            dyn_objects,
            ExchangeConfig::default(),
        )
        .await;
        let discovery = Hyperspace::start(
            Arc::clone(&local),
            Arc::clone(&exchange),
            Arc::clone(&store),
            bootstrap.to_vec(),
        )
        .await;

        TestNode {
            address,
            local,
            transport,
            store,
            objects,
            exchange,
            discovery,
        }
    }
}

/// One running node in a test network.
pub struct TestNode {
    address: String,
    pub local: Arc<LocalPeer>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<ProximityStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub exchange: Arc<Exchange>,
    pub discovery: Arc<Hyperspace>,
}

impl TestNode {
    pub fn address(&self) -> String {
        self.address.clone()
    }

    pub fn public_key(&self) -> PublicKey {
        self.local.public_key()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.local.fingerprint()
    }
}

/// Transport whose dials always fail immediately, counting attempts.
#[derive(Default)]
pub struct CountingTransport {
    dials: AtomicUsize,
}

impl CountingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, NetError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(NetError::DialFailed(format!("refusing {}", address)))
    }

    async fn accept(&self) -> Option<Arc<dyn Connection>> {
        std::future::pending().await
    }
}

/// Transport whose dials never complete.
pub struct HangingTransport;

#[async_trait]
impl Transport for HangingTransport {
    async fn dial(&self, _address: &str) -> Result<Arc<dyn Connection>, NetError> {
        std::future::pending().await
    }

    async fn accept(&self) -> Option<Arc<dyn Connection>> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bootstrap_gossip_populates_stores() {
        init_tracing();
        let network = TestNetwork::new();
        let a = network.node(1, &[]).await;
        let b = network.node(2, &[a.address()]).await;

        for _ in 0..500 {
            if a.store.get(&b.public_key()).await.is_some()
                && b.store.get(&a.public_key()).await.is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let record = b.store.get(&a.public_key()).await.unwrap();
        assert_eq!(record.addresses, vec![a.address()]);
        assert!(a.store.get(&b.public_key()).await.is_some());
    }

    #[tokio::test]
    async fn test_seeded_nodes_are_deterministic() {
        let network = TestNetwork::new();
        let first = network.node(1, &[]).await;
        let again = LocalPeer::from_seed(1, vec![]);
        assert_eq!(first.public_key(), again.public_key());
    }
}
