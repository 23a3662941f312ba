//! Exchange - the send/receive surface of the transport
//!
//! One exchange per node. Outbound: `send` resolves a [`Lookup`] to peer
//! records and fans the object out through per-recipient outboxes,
//! aggregating per-recipient outcomes into a [`SendReport`]. Inbound:
//! every accepted or dialed connection gets a read loop that publishes
//! each object as an [`Envelope`] on the inbox, where subscribers pick
//! them up by filter.
//!
//! The exchange also runs two standing handlers: it serves object
//! requests out of the local object store, and it absorbs gossiped peer
//! records into the proximity store.

pub mod inbox;
pub mod outbox;

pub use inbox::{Envelope, EnvelopeFilter, Inbox, Subscription};
pub use outbox::{OutboxKey, OutboxRequest, SendError, MAX_SEND_ATTEMPTS};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::discovery::{DiscoveryError, Lookup, Resolver};
use crate::discovery::store::ProximityStore;
use crate::identity::{LocalPeer, PublicKey};
use crate::net::{Connection, Transport};
use crate::object::messages::{self, ObjectRequest};
use crate::object::{Object, ObjectError, ObjectHash};
use crate::peer::Peer;
use crate::store::ObjectStore;
use outbox::{ConnectionSink, Outbox, Outboxes};

/// Default per-send deadline.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Exchange tuning knobs.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Deadline applied to sends that carry no explicit timeout
    pub send_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Return once queued instead of waiting for delivery outcomes
    pub async_send: bool,
    /// Resolve recipients from the local store only, never the network
    pub local_only: bool,
    /// Deadline override for this send
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue and return; outcomes are logged, not reported.
    pub fn asynchronous(mut self) -> Self {
        self.async_send = true;
        self
    }

    /// Resolve from the local store only.
    pub fn local(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-recipient outcomes of one send.
///
/// Asynchronous sends return an empty report; the outcomes land in logs.
#[derive(Debug, Default)]
pub struct SendReport {
    pub delivered: Vec<PublicKey>,
    pub failed: Vec<(PublicKey, SendError)>,
}

/// Error on the send path
#[derive(Debug)]
pub enum ExchangeError {
    /// Resolution produced no recipients
    NoRecipients,
    /// Recipient resolution failed
    Resolve(DiscoveryError),
    /// Building the object failed
    Object(ObjectError),
    /// Queueing or delivery failed
    Send(SendError),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::NoRecipients => write!(f, "no recipients resolved"),
            ExchangeError::Resolve(e) => write!(f, "recipient resolution failed: {}", e),
            ExchangeError::Object(e) => write!(f, "object error: {}", e),
            ExchangeError::Send(e) => write!(f, "send failed: {}", e),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<ObjectError> for ExchangeError {
    fn from(e: ObjectError) -> Self {
        ExchangeError::Object(e)
    }
}

/// The node's object exchange.
pub struct Exchange {
    local: Arc<LocalPeer>,
    peers: Arc<ProximityStore>,
    objects: Arc<dyn ObjectStore>,
    inbox: Inbox,
    outboxes: Outboxes,
    resolver: RwLock<Option<Arc<dyn Resolver>>>,
    config: ExchangeConfig,
}

impl Exchange {
    /// Start the exchange: accept loop, object-request responder, and
    /// peer-gossip absorber. The discoverer is bound later through
    /// [`Exchange::set_resolver`].
    pub async fn start(
        local: Arc<LocalPeer>,
        transport: Arc<dyn Transport>,
        peers: Arc<ProximityStore>,
        objects: Arc<dyn ObjectStore>,
        config: ExchangeConfig,
    ) -> Arc<Self> {
        let exchange = Arc::new(Self {
            local,
            peers,
            objects,
            inbox: Inbox::new(),
            outboxes: Outboxes::new(Arc::clone(&transport)),
            resolver: RwLock::new(None),
            config,
        });

        let sink: Arc<dyn ConnectionSink> = exchange.clone();
        exchange.outboxes.set_sink(Arc::downgrade(&sink)).await;

        tokio::spawn(accept_loop(transport, Arc::clone(&exchange)));
        tokio::spawn(serve_object_requests(Arc::clone(&exchange)));
        tokio::spawn(absorb_peer_gossip(Arc::clone(&exchange)));
        exchange
    }

    pub fn local(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    pub fn peers(&self) -> &Arc<ProximityStore> {
        &self.peers
    }

    /// Late-bind the recipient resolver.
    pub async fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.resolver.write().await = Some(resolver);
    }

    /// Subscribe to inbound envelopes matching `filter`.
    pub async fn subscribe(&self, filter: EnvelopeFilter) -> Subscription {
        self.inbox.subscribe(filter).await
    }

    /// Resolve recipients for `lookup` and deliver `object` to each.
    pub async fn send(
        &self,
        object: Object,
        lookup: Lookup,
        options: SendOptions,
    ) -> Result<SendReport, ExchangeError> {
        let recipients: Vec<Peer> = self
            .resolve(&lookup, options.local_only)
            .await?
            .into_iter()
            .filter(|p| p.public_key != self.local.public_key())
            .collect();
        if recipients.is_empty() {
            return Err(ExchangeError::NoRecipients);
        }
        trace!(
            object_type = object.object_type(),
            recipients = recipients.len(),
            "sending object"
        );
        Ok(self.deliver(object, recipients, &options).await)
    }

    /// Deliver directly to a raw address, with no identity expectation.
    /// Used for bootstrapping before any peer record exists.
    pub async fn send_to_address(
        &self,
        object: Object,
        address: &str,
        options: SendOptions,
    ) -> Result<(), ExchangeError> {
        let outbox = self
            .outboxes
            .get_or_create(OutboxKey::Address(address.to_string()))
            .await;
        let deadline = Instant::now() + options.timeout.unwrap_or(self.config.send_timeout);
        // Placeholder recipient; an address-keyed outbox dials its own
        // address, so only the address field matters.
        let recipient = Peer::new(PublicKey::from_bytes([0u8; 32]), vec![address.to_string()]);

        let (reply, rx) = if options.async_send {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        outbox
            .enqueue(OutboxRequest {
                recipient,
                object,
                deadline,
                reply,
            })
            .map_err(ExchangeError::Send)?;
        if let Some(rx) = rx {
            rx.await
                .map_err(|_| ExchangeError::Send(SendError::QueueClosed))?
                .map_err(ExchangeError::Send)?;
        }
        Ok(())
    }

    /// Request an object by hash from whoever `lookup` resolves to. The
    /// object itself arrives later as an envelope; subscribe for it.
    pub async fn request(
        &self,
        hash: ObjectHash,
        lookup: Lookup,
        options: SendOptions,
    ) -> Result<SendReport, ExchangeError> {
        let object = Object::from_body(&ObjectRequest { object_hash: hash })?;
        self.send(object, lookup, options).await
    }

    async fn resolve(&self, lookup: &Lookup, local_only: bool) -> Result<Vec<Peer>, ExchangeError> {
        let resolver = self.resolver.read().await.clone();
        if let (Some(resolver), false) = (resolver, local_only) {
            return resolver.resolve(lookup).await.map_err(ExchangeError::Resolve);
        }
        Ok(match lookup {
            Lookup::Fingerprint(fingerprint) => self
                .peers
                .find_by_fingerprint(fingerprint)
                .await
                .into_iter()
                .collect(),
            Lookup::Content(bloom) => self.peers.find_by_content(bloom).await,
        })
    }

    async fn deliver(
        &self,
        object: Object,
        recipients: Vec<Peer>,
        options: &SendOptions,
    ) -> SendReport {
        let deadline = Instant::now() + options.timeout.unwrap_or(self.config.send_timeout);
        let mut waiting = Vec::new();
        for peer in recipients {
            let key = peer.public_key;
            let outbox = self
                .outboxes
                .get_or_create(OutboxKey::Confirmed(key))
                .await;
            let reply = if options.async_send {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                waiting.push((key, rx));
                Some(tx)
            };
            let queued = outbox.enqueue(OutboxRequest {
                recipient: peer,
                object: object.clone(),
                deadline,
                reply,
            });
            if let Err(e) = queued {
                // The dropped reply sender surfaces as QueueClosed below.
                debug!(recipient = %key, error = %e, "enqueue failed");
            }
        }

        let mut report = SendReport::default();
        let outcomes = join_all(
            waiting
                .into_iter()
                .map(|(key, rx)| async move { (key, rx.await) }),
        )
        .await;
        for (key, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => report.delivered.push(key),
                Ok(Err(e)) => report.failed.push((key, e)),
                Err(_) => report.failed.push((key, SendError::QueueClosed)),
            }
        }
        report
    }

    /// Queue a fire-and-forget object for a known peer, bypassing
    /// resolution. Failures are logged by the outbox worker.
    pub(crate) async fn notify_peer(&self, object: Object, peer: Peer, timeout: Duration) {
        let outbox = self
            .outboxes
            .get_or_create(OutboxKey::Confirmed(peer.public_key))
            .await;
        let queued = outbox.enqueue(OutboxRequest {
            recipient: peer,
            object,
            deadline: Instant::now() + timeout,
            reply: None,
        });
        if let Err(e) = queued {
            debug!(outbox = %outbox.key(), error = %e, "notify enqueue failed");
        }
    }

    /// Reply to a peer we just heard from. The outbox usually still holds
    /// the bound connection; otherwise the stored record is dialed.
    pub(crate) async fn reply(&self, object: Object, to: PublicKey) {
        let peer = match self.peers.get(&to).await {
            Some(peer) => peer,
            None => Peer::bare(to),
        };
        self.notify_peer(object, peer, self.config.send_timeout).await;
    }

    async fn adopt_connection(&self, connection: Arc<dyn Connection>) {
        let outbox = self
            .outboxes
            .get_or_create(OutboxKey::Confirmed(connection.remote_key()))
            .await;
        self.outboxes.bind(&outbox, connection).await;
    }
}

#[async_trait]
impl ConnectionSink for Exchange {
    async fn connection_opened(&self, outbox: &Arc<Outbox>, connection: &Arc<dyn Connection>) {
        // Greet with our signed peer record so both ends learn each
        // other's addresses and content bloom.
        match self.local.signed_peer().await {
            Ok(greeting) => {
                let queued = outbox.enqueue(OutboxRequest {
                    recipient: Peer::bare(connection.remote_key()),
                    object: greeting,
                    deadline: Instant::now() + self.config.send_timeout,
                    reply: None,
                });
                if queued.is_err() {
                    debug!(outbox = %outbox.key(), "greeting dropped, outbox worker gone");
                }
            }
            Err(e) => warn!(error = %e, "failed to build signed peer greeting"),
        }

        let inbox = self.inbox.clone();
        let outbox = Arc::clone(outbox);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            loop {
                match connection.read_object().await {
                    Ok(payload) => {
                        inbox
                            .publish(Envelope {
                                sender: connection.remote_key(),
                                payload,
                            })
                            .await;
                    }
                    Err(e) => {
                        trace!(outbox = %outbox.key(), error = %e, "read loop ended");
                        outbox.clear_connection(&connection).await;
                        break;
                    }
                }
            }
        });
    }
}

async fn accept_loop(transport: Arc<dyn Transport>, exchange: Arc<Exchange>) {
    while let Some(connection) = transport.accept().await {
        trace!(remote = %connection.remote_key(), "inbound connection");
        exchange.adopt_connection(connection).await;
    }
    debug!("transport stopped accepting");
}

/// Serve object requests out of the local object store. Requests for
/// hashes we do not hold are ignored.
async fn serve_object_requests(exchange: Arc<Exchange>) {
    let mut requests = exchange
        .subscribe(EnvelopeFilter::new().object_type(messages::OBJECT_REQUEST_TYPE))
        .await;
    while let Some(envelope) = requests.next().await {
        let request: ObjectRequest = match envelope.payload.decode_body() {
            Ok(request) => request,
            Err(e) => {
                debug!(from = %envelope.sender, error = %e, "malformed object request");
                continue;
            }
        };
        match exchange.objects.get(&request.object_hash).await {
            Some(object) => {
                trace!(hash = %request.object_hash, requester = %envelope.sender, "serving object");
                exchange.reply(object, envelope.sender).await;
            }
            None => {
                trace!(hash = %request.object_hash, "object request for unknown hash ignored");
            }
        }
    }
}

/// Absorb gossiped peer records into the proximity store. Records arrive
/// over an authenticated connection and replace wholesale on upsert, so
/// no object-layer signature is required here.
async fn absorb_peer_gossip(exchange: Arc<Exchange>) {
    let mut records = exchange
        .subscribe(EnvelopeFilter::new().object_type(messages::PEER_TYPE))
        .await;
    while let Some(envelope) = records.next().await {
        match envelope.payload.decode_body::<Peer>() {
            Ok(peer) => {
                trace!(peer = %peer.public_key, from = %envelope.sender, "peer record gossiped");
                exchange.peers.add_peer(peer).await;
            }
            Err(e) => debug!(from = %envelope.sender, error = %e, "malformed peer record discarded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bloom::Bloom;
    use crate::net::memory::MemoryNetwork;
    use crate::store::MemoryObjectStore;

    struct Node {
        local: Arc<LocalPeer>,
        exchange: Arc<Exchange>,
        peers: Arc<ProximityStore>,
        objects: Arc<MemoryObjectStore>,
    }

    async fn start_node(network: &Arc<MemoryNetwork>, seed: u8) -> Node {
        let address = format!("mem:{}", seed);
        let local = Arc::new(LocalPeer::from_seed(seed, vec![address.clone()]));
        let transport: Arc<dyn Transport> =
            network.transport(local.public_key(), vec![address]).await;
        let peers = Arc::new(ProximityStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let store: Arc<dyn ObjectStore> = Arc::clone(&objects) as Arc<dyn ObjectStore>;
        let exchange = Exchange::start(
            Arc::clone(&local),
            transport,
            Arc::clone(&peers),
            store,
            ExchangeConfig::default(),
        )
        .await;
        Node {
            local,
            exchange,
            peers,
            objects,
        }
    }

    /// Poll until both stores hold the other node's record.
    async fn wait_for_mutual_records(a: &Node, b: &Node) {
        for _ in 0..500 {
            if b.peers.get(&a.local.public_key()).await.is_some()
                && a.peers.get(&b.local.public_key()).await.is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer records not gossiped in time");
    }

    #[tokio::test]
    async fn test_send_delivers_to_resolved_peer() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;
        a.peers.add_peer(b.local.peer().await).await;

        let mut received = b
            .exchange
            .subscribe(EnvelopeFilter::new().object_type("app/ping"))
            .await;
        let report = a
            .exchange
            .send(
                Object::new("app/ping", b"hi".to_vec()),
                Lookup::Fingerprint(b.local.fingerprint()),
                SendOptions::new().local(),
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![b.local.public_key()]);
        assert!(report.failed.is_empty());
        let envelope = received.next().await.unwrap();
        assert_eq!(envelope.sender, a.local.public_key());
        assert_eq!(envelope.payload.object_type(), "app/ping");
    }

    #[tokio::test]
    async fn test_greetings_populate_both_stores() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;
        a.peers.add_peer(b.local.peer().await).await;

        a.exchange
            .send(
                Object::new("app/ping", vec![]),
                Lookup::Fingerprint(b.local.fingerprint()),
                SendOptions::new().local(),
            )
            .await
            .unwrap();

        // Each side greeted with its signed record over the connection.
        wait_for_mutual_records(&a, &b).await;
        let record = b.peers.get(&a.local.public_key()).await.unwrap();
        assert_eq!(record.addresses, vec!["mem:1".to_string()]);
    }

    #[tokio::test]
    async fn test_send_without_recipients() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let unknown = PublicKey::from_bytes([9u8; 32]).fingerprint();

        let result = a
            .exchange
            .send(
                Object::new("app/ping", vec![]),
                Lookup::Fingerprint(unknown),
                SendOptions::new().local(),
            )
            .await;
        assert!(matches!(result, Err(ExchangeError::NoRecipients)));
    }

    #[tokio::test]
    async fn test_report_aggregates_mixed_outcomes() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;

        b.local
            .set_content_hashes(["x".to_string()])
            .await;
        a.peers.add_peer(b.local.peer().await).await;
        // A second supposed provider that nothing listens for.
        let dead = PublicKey::from_bytes([9u8; 32]);
        a.peers
            .add_peer(
                Peer::new(dead, vec!["mem:dead".to_string()])
                    .with_content_bloom(Bloom::new(["x"])),
            )
            .await;

        let report = a
            .exchange
            .send(
                Object::new("app/ping", vec![]),
                Lookup::Content(Bloom::new(["x"])),
                SendOptions::new().local(),
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![b.local.public_key()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, dead);
        assert!(matches!(report.failed[0].1, SendError::Dial(_)));
    }

    #[tokio::test]
    async fn test_send_to_address_without_record() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;

        let mut received = b
            .exchange
            .subscribe(EnvelopeFilter::new().object_type("app/hello"))
            .await;
        a.exchange
            .send_to_address(
                Object::new("app/hello", vec![]),
                "mem:2",
                SendOptions::new(),
            )
            .await
            .unwrap();

        let envelope = received.next().await.unwrap();
        assert_eq!(envelope.sender, a.local.public_key());
    }

    #[tokio::test]
    async fn test_asynchronous_send_returns_before_delivery() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;
        a.peers.add_peer(b.local.peer().await).await;

        let mut received = b
            .exchange
            .subscribe(EnvelopeFilter::new().object_type("app/ping"))
            .await;
        let report = a
            .exchange
            .send(
                Object::new("app/ping", vec![]),
                Lookup::Fingerprint(b.local.fingerprint()),
                SendOptions::new().local().asynchronous(),
            )
            .await
            .unwrap();

        // Nothing waited on, nothing reported.
        assert!(report.delivered.is_empty());
        assert!(report.failed.is_empty());
        assert!(received.next().await.is_some());
    }

    #[tokio::test]
    async fn test_object_request_served_from_store() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;
        a.peers.add_peer(b.local.peer().await).await;

        let blob = Object::new("app/blob", b"data".to_vec());
        let hash = b.objects.put(blob.clone()).await;

        let mut received = a
            .exchange
            .subscribe(EnvelopeFilter::new().object_type("app/blob"))
            .await;
        let report = a
            .exchange
            .request(
                hash,
                Lookup::Fingerprint(b.local.fingerprint()),
                SendOptions::new().local(),
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![b.local.public_key()]);

        let envelope = received.next().await.unwrap();
        assert_eq!(envelope.payload, blob);
        assert_eq!(envelope.sender, b.local.public_key());
    }

    #[tokio::test]
    async fn test_object_request_for_unknown_hash_ignored() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1).await;
        let b = start_node(&network, 2).await;
        a.peers.add_peer(b.local.peer().await).await;

        let missing = Object::new("app/blob", b"missing".to_vec()).hash();
        let mut received = a
            .exchange
            .subscribe(EnvelopeFilter::new().object_type("app/blob"))
            .await;

        // The request itself delivers; no response ever comes.
        let report = a
            .exchange
            .request(
                missing,
                Lookup::Fingerprint(b.local.fingerprint()),
                SendOptions::new().local(),
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![b.local.public_key()]);
        let silence =
            tokio::time::timeout(Duration::from_millis(200), received.next()).await;
        assert!(silence.is_err());
    }
}
