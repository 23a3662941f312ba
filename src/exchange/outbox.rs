//! Outbox - per-recipient send queue and connection lifecycle
//!
//! One outbox per distinct recipient key (or per raw address before the
//! identity is confirmed). A single worker per outbox drains its FIFO
//! queue, reusing the live connection or dialing, retrying up to
//! [`MAX_SEND_ATTEMPTS`] times, and reporting each request's outcome on a
//! oneshot channel. A dialed connection whose verified identity differs
//! from the outbox's key - always the case for an address-keyed outbox -
//! is handed, together with the request, to the outbox keyed by that
//! identity. The hand-off is the pending-to-confirmed transition, not a
//! failure; address outboxes never hold a connection themselves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::identity::PublicKey;
use crate::net::{Connection, Transport};
use crate::object::Object;
use crate::peer::Peer;

/// Maximum dial/write attempts per request.
pub const MAX_SEND_ATTEMPTS: usize = 3;

/// Error delivering a single request
#[derive(Debug, Clone)]
pub enum SendError {
    /// Recipient has no address to dial
    NoAddresses,
    /// The request's deadline passed
    Timeout,
    /// All dial attempts failed
    Dial(String),
    /// Writing the object failed
    Write(String),
    /// The outbox worker is gone
    QueueClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NoAddresses => write!(f, "recipient has no addresses"),
            SendError::Timeout => write!(f, "send timed out"),
            SendError::Dial(e) => write!(f, "dial failed: {}", e),
            SendError::Write(e) => write!(f, "write failed: {}", e),
            SendError::QueueClosed => write!(f, "outbox queue closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Identity state of an outbox.
///
/// `Address` is the pending-identity state used when only a raw address is
/// known; `Confirmed` outboxes are keyed by the verified remote identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutboxKey {
    Confirmed(PublicKey),
    Address(String),
}

impl std::fmt::Display for OutboxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxKey::Confirmed(key) => write!(f, "peer:{}", key),
            OutboxKey::Address(address) => write!(f, "addr:{}", address),
        }
    }
}

/// One queued outbound request.
pub struct OutboxRequest {
    /// Recipient record, used to resolve a dial address
    pub recipient: Peer,
    /// The object to deliver
    pub object: Object,
    /// Absolute deadline; checked before every attempt and bounding I/O
    pub deadline: Instant,
    /// Result channel. `None` for fire-and-forget (greetings, gossip).
    pub reply: Option<oneshot::Sender<Result<(), SendError>>>,
}

impl OutboxRequest {
    fn respond(mut self, result: Result<(), SendError>) {
        match self.reply.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(e) = result {
                    debug!(error = %e, "fire-and-forget send failed");
                }
            }
        }
    }
}

/// A per-recipient send queue plus its exclusively-owned connection slot.
pub struct Outbox {
    key: OutboxKey,
    queue: mpsc::UnboundedSender<OutboxRequest>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl Outbox {
    pub fn key(&self) -> &OutboxKey {
        &self.key
    }

    /// Queue a request for the worker. FIFO order is preserved.
    pub fn enqueue(&self, request: OutboxRequest) -> Result<(), SendError> {
        self.queue.send(request).map_err(|_| SendError::QueueClosed)
    }

    pub async fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().await.clone()
    }

    /// Install a connection, closing any replaced one.
    pub async fn set_connection(&self, connection: Arc<dyn Connection>) {
        let replaced = {
            let mut slot = self.connection.lock().await;
            slot.replace(connection)
        };
        if let Some(old) = replaced {
            trace!(outbox = %self.key, "closing replaced connection");
            old.close().await;
        }
    }

    /// Drop the stored connection reference, but only if it is still the
    /// one that failed. A connection swapped in meanwhile stays.
    pub async fn clear_connection(&self, failed: &Arc<dyn Connection>) {
        let mut slot = self.connection.lock().await;
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, failed) {
                *slot = None;
            }
        }
    }
}

/// Hook invoked whenever a connection is bound to an outbox. The exchange
/// uses it to start the read loop and send the greeting.
#[async_trait]
pub(crate) trait ConnectionSink: Send + Sync {
    async fn connection_opened(&self, outbox: &Arc<Outbox>, connection: &Arc<dyn Connection>);
}

struct OutboxesInner {
    transport: Arc<dyn Transport>,
    map: RwLock<HashMap<OutboxKey, Arc<Outbox>>>,
    sink: RwLock<Option<Weak<dyn ConnectionSink>>>,
}

/// Registry of all outboxes, keyed by identity or raw address.
///
/// `get_or_create` is atomic under the registry lock, which is what makes
/// the cross-outbox identity hand-off safe.
#[derive(Clone)]
pub(crate) struct Outboxes {
    inner: Arc<OutboxesInner>,
}

impl Outboxes {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(OutboxesInner {
                transport,
                map: RwLock::new(HashMap::new()),
                sink: RwLock::new(None),
            }),
        }
    }

    /// Late-bind the connection sink (the exchange).
    pub async fn set_sink(&self, sink: Weak<dyn ConnectionSink>) {
        *self.inner.sink.write().await = Some(sink);
    }

    /// Get the outbox for `key`, creating it and starting its worker on
    /// first use. Atomic under the registry lock.
    ///
    /// Boxed: workers reach back into the registry through `hand_off`,
    /// and an unboxed future would make the spawned worker recursive.
    pub fn get_or_create(
        &self,
        key: OutboxKey,
    ) -> Pin<Box<dyn Future<Output = Arc<Outbox>> + Send + '_>> {
        Box::pin(self.get_or_create_inner(key))
    }

    async fn get_or_create_inner(&self, key: OutboxKey) -> Arc<Outbox> {
        {
            let map = self.inner.map.read().await;
            if let Some(outbox) = map.get(&key) {
                return Arc::clone(outbox);
            }
        }
        let mut map = self.inner.map.write().await;
        if let Some(outbox) = map.get(&key) {
            return Arc::clone(outbox);
        }
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let outbox = Arc::new(Outbox {
            key: key.clone(),
            queue: queue_tx,
            connection: Mutex::new(None),
        });
        map.insert(key.clone(), Arc::clone(&outbox));
        trace!(outbox = %key, "starting outbox worker");
        tokio::spawn(run_worker(Arc::clone(&outbox), queue_rx, self.clone()));
        outbox
    }

    /// Install a connection on an outbox and notify the sink.
    pub async fn bind(&self, outbox: &Arc<Outbox>, connection: Arc<dyn Connection>) {
        outbox.set_connection(Arc::clone(&connection)).await;
        let sink = self.inner.sink.read().await.clone();
        if let Some(sink) = sink.and_then(|weak| weak.upgrade()) {
            sink.connection_opened(outbox, &connection).await;
        }
    }

    /// Hand a request and its connection to the outbox keyed by the
    /// connection's verified identity: the confirmation step for
    /// address-keyed outboxes, and the recovery step when a confirmed
    /// outbox dialed into someone else. Nothing is reported on the
    /// original request; it continues life in the correct queue.
    async fn hand_off(&self, connection: Arc<dyn Connection>, request: OutboxRequest) {
        let actual = connection.remote_key();
        debug!(actual = %actual, "handing connection to its confirmed outbox");
        let target = self.get_or_create(OutboxKey::Confirmed(actual)).await;
        self.bind(&target, connection).await;
        if let Err(SendError::QueueClosed) = target.enqueue(request) {
            debug!(actual = %actual, "hand-off target queue closed, request dropped");
        }
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, key: &OutboxKey) -> bool {
        self.inner.map.read().await.contains_key(key)
    }
}

/// Pick the address to dial for a request on this outbox.
fn resolve_address(key: &OutboxKey, recipient: &Peer) -> Option<String> {
    match key {
        OutboxKey::Address(address) => Some(address.clone()),
        OutboxKey::Confirmed(_) => recipient.addresses.first().cloned(),
    }
}

async fn run_worker(
    outbox: Arc<Outbox>,
    mut queue: mpsc::UnboundedReceiver<OutboxRequest>,
    registry: Outboxes,
) {
    while let Some(request) = queue.recv().await {
        process_request(&outbox, request, &registry).await;
    }
    trace!(outbox = %outbox.key, "outbox worker stopped");
}

/// Deliver one request: reuse-or-dial, identity check, write, retry.
async fn process_request(outbox: &Arc<Outbox>, request: OutboxRequest, registry: &Outboxes) {
    if Instant::now() >= request.deadline {
        request.respond(Err(SendError::Timeout));
        return;
    }

    let mut last_error = SendError::Timeout;
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        if Instant::now() >= request.deadline {
            last_error = SendError::Timeout;
            break;
        }

        let connection = match outbox.connection().await {
            Some(connection) => connection,
            None => {
                let address = match resolve_address(&outbox.key, &request.recipient) {
                    Some(address) => address,
                    None => {
                        last_error = SendError::NoAddresses;
                        break;
                    }
                };
                match timeout_at(request.deadline, registry.transport().dial(&address)).await {
                    Err(_) => {
                        last_error = SendError::Timeout;
                        break;
                    }
                    Ok(Err(e)) => {
                        trace!(outbox = %outbox.key, attempt, error = %e, "dial failed");
                        last_error = SendError::Dial(e.to_string());
                        continue;
                    }
                    Ok(Ok(connection)) => {
                        let remote = connection.remote_key();
                        let confirmed =
                            matches!(&outbox.key, OutboxKey::Confirmed(key) if *key == remote);
                        if !confirmed {
                            // Identity is known now; the request and the
                            // connection move to the keyed outbox.
                            registry.hand_off(connection, request).await;
                            return;
                        }
                        registry.bind(outbox, Arc::clone(&connection)).await;
                        connection
                    }
                }
            }
        };

        match timeout_at(request.deadline, connection.write_object(&request.object)).await {
            Ok(Ok(())) => {
                trace!(outbox = %outbox.key, attempt, "object delivered");
                request.respond(Ok(()));
                return;
            }
            Ok(Err(e)) => {
                trace!(outbox = %outbox.key, attempt, error = %e, "write failed, dropping connection");
                outbox.clear_connection(&connection).await;
                connection.close().await;
                last_error = SendError::Write(e.to_string());
            }
            Err(_) => {
                last_error = SendError::Timeout;
                break;
            }
        }
    }
    request.respond(Err(last_error));
}
