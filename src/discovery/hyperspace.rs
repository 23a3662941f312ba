//! Hyperspace discoverer
//!
//! Resolves fingerprints and content blooms over the network. Every
//! lookup asks the closest known peers (by bloom proximity) and waits up
//! to [`LOOKUP_WINDOW`] for responses on the inbox; the subscription is
//! registered before anything is sent so no response can slip past. The
//! discoverer also answers the other side of the protocol: peer requests,
//! bloom requests, and signed bloom advertisements.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::bloom::Bloom;
use crate::discovery::store::ProximityStore;
use crate::discovery::{DiscoveryError, Lookup, Resolver};
use crate::exchange::{Envelope, EnvelopeFilter, Exchange, SendOptions};
use crate::identity::{Fingerprint, LocalPeer};
use crate::object::messages::{
    self, ContentBloom, ContentBloomRequest, PeerRequest, ProtocolMessage,
};
use crate::object::Object;
use crate::peer::Peer;

/// How long a network lookup collects responses.
pub const LOOKUP_WINDOW: Duration = Duration::from_secs(5);

/// The bloom-proximity discoverer.
pub struct Hyperspace {
    local: Arc<LocalPeer>,
    exchange: Arc<Exchange>,
    peers: Arc<ProximityStore>,
}

impl Hyperspace {
    /// Start the discoverer: bind it as the exchange's resolver, serve
    /// inbound discovery messages, announce to the bootstrap addresses,
    /// and advertise the content bloom now and on every content change.
    pub async fn start(
        local: Arc<LocalPeer>,
        exchange: Arc<Exchange>,
        peers: Arc<ProximityStore>,
        bootstrap_addresses: Vec<String>,
    ) -> Arc<Self> {
        let hyperspace = Arc::new(Self {
            local,
            exchange,
            peers,
        });

        let resolver: Arc<dyn Resolver> = hyperspace.clone();
        hyperspace.exchange.set_resolver(resolver).await;

        tokio::spawn(serve_lookups(Arc::clone(&hyperspace)));
        tokio::spawn(track_content_changes(Arc::clone(&hyperspace)));

        hyperspace.bootstrap(&bootstrap_addresses).await;
        hyperspace.advertise_content().await;
        hyperspace
    }

    /// Announce ourselves to raw bootstrap addresses: a peer request for
    /// our own fingerprint (so the peer tells us who it knows near us)
    /// and our signed record (so it can route others to us).
    pub async fn bootstrap(&self, addresses: &[String]) {
        for address in addresses {
            trace!(address, "bootstrapping");
            let request = PeerRequest {
                keys: vec![self.local.fingerprint().to_string()],
            };
            match Object::from_body(&request) {
                Ok(object) => {
                    let sent = self
                        .exchange
                        .send_to_address(object, address, SendOptions::new().asynchronous())
                        .await;
                    if let Err(e) = sent {
                        debug!(address, error = %e, "bootstrap request not queued");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode bootstrap request"),
            }
            match self.local.signed_peer().await {
                Ok(object) => {
                    let sent = self
                        .exchange
                        .send_to_address(object, address, SendOptions::new().asynchronous())
                        .await;
                    if let Err(e) = sent {
                        debug!(address, error = %e, "bootstrap announcement not queued");
                    }
                }
                Err(e) => warn!(error = %e, "failed to sign local peer record"),
            }
        }
    }

    /// Advertise the current content bloom to the closest known peers.
    pub async fn advertise_content(&self) {
        if self.local.content_hashes().await.is_empty() {
            trace!("no content hashes to advertise");
            return;
        }
        let bloom = self.local.content_bloom().await;
        let mut object = match Object::from_body(&ContentBloom {
            bloom: bloom.clone(),
        }) {
            Ok(object) => object,
            Err(e) => {
                warn!(error = %e, "failed to encode content bloom");
                return;
            }
        };
        object.sign(&self.local);

        let targets = self.candidates_for(&bloom).await;
        if targets.is_empty() {
            debug!("no peers to advertise content bloom to");
            return;
        }
        trace!(targets = targets.len(), "advertising content bloom");
        for peer in targets {
            self.exchange
                .notify_peer(object.clone(), peer, LOOKUP_WINDOW)
                .await;
        }
    }

    /// Look up a peer record by fingerprint on the network. Returns the
    /// first matching record, or empty once the window elapses.
    pub async fn lookup_peer(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Peer>, DiscoveryError> {
        let candidates: Vec<Peer> = self
            .peers
            .closest_peers(fingerprint)
            .await
            .into_iter()
            .filter(|p| p.public_key != self.local.public_key())
            .collect();
        if candidates.is_empty() {
            return Err(DiscoveryError::NoPeersToAsk);
        }

        // Subscribe before asking so no response can slip past.
        let mut responses = self
            .exchange
            .subscribe(EnvelopeFilter::new().object_type(messages::PEER_TYPE))
            .await;

        let request = Object::from_body(&PeerRequest {
            keys: vec![fingerprint.to_string()],
        })?;
        trace!(%fingerprint, candidates = candidates.len(), "asking closest peers");
        for peer in candidates {
            self.exchange
                .notify_peer(request.clone(), peer, LOOKUP_WINDOW)
                .await;
        }

        let deadline = Instant::now() + LOOKUP_WINDOW;
        let mut found = Vec::new();
        while let Ok(Some(envelope)) = timeout_at(deadline, responses.next()).await {
            let peer = match envelope.payload.decode_body::<Peer>() {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(from = %envelope.sender, error = %e, "malformed peer response");
                    continue;
                }
            };
            self.peers.add_peer(peer.clone()).await;
            if peer.fingerprint() == *fingerprint {
                trace!(%fingerprint, "peer resolved");
                found.push(peer);
                break;
            }
        }
        responses.cancel().await;
        // An empty window is a completed negative lookup, not an error.
        Ok(found)
    }

    /// Look up providers for a content bloom. Unlike the peer lookup this
    /// drains the whole window, since useful records can keep arriving,
    /// then re-reads the store.
    pub async fn lookup_content_providers(
        &self,
        query: &Bloom,
    ) -> Result<Vec<Fingerprint>, DiscoveryError> {
        let candidates = self.candidates_for(query).await;
        if candidates.is_empty() {
            return Err(DiscoveryError::NoPeersToAsk);
        }

        let mut responses = self
            .exchange
            .subscribe(
                EnvelopeFilter::new()
                    .object_type(messages::BLOOM_TYPE)
                    .object_type(messages::PEER_TYPE),
            )
            .await;

        let request = Object::from_body(&ContentBloomRequest {
            bloom: query.clone(),
        })?;
        trace!(candidates = candidates.len(), "asking for content providers");
        for peer in candidates {
            self.exchange
                .notify_peer(request.clone(), peer, LOOKUP_WINDOW)
                .await;
        }

        let deadline = Instant::now() + LOOKUP_WINDOW;
        while let Ok(Some(envelope)) = timeout_at(deadline, responses.next()).await {
            self.absorb_response(envelope).await;
        }
        responses.cancel().await;

        Ok(self
            .peers
            .find_by_content(query)
            .await
            .into_iter()
            .filter(|p| p.public_key != self.local.public_key())
            .map(|p| p.fingerprint())
            .collect())
    }

    /// Candidate peers for a query bloom: ranked providers first, ranked
    /// peers as fallback, deduplicated, self excluded.
    async fn candidates_for(&self, query: &Bloom) -> Vec<Peer> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let providers = self.peers.closest_content_providers(query).await;
        let nearby = self.peers.closest_peers_by_bloom(query).await;
        for peer in providers.into_iter().chain(nearby) {
            if peer.public_key == self.local.public_key() {
                continue;
            }
            if seen.insert(peer.public_key) {
                candidates.push(peer);
            }
        }
        candidates
    }

    async fn absorb_response(&self, envelope: Envelope) {
        match ProtocolMessage::decode(&envelope.payload) {
            Ok(Some(ProtocolMessage::Peer(peer))) => self.peers.add_peer(peer).await,
            Ok(Some(ProtocolMessage::ContentBloom(_))) => self.apply_bloom(&envelope).await,
            Ok(_) => {}
            Err(e) => debug!(from = %envelope.sender, error = %e, "malformed lookup response"),
        }
    }

    /// Apply a signed bloom advertisement to the signer's store record.
    /// Unsigned or badly signed advertisements are discarded.
    async fn apply_bloom(&self, envelope: &Envelope) {
        let signer = match envelope.payload.signer() {
            Some(signer) => signer,
            None => {
                debug!(from = %envelope.sender, "unsigned content bloom discarded");
                return;
            }
        };
        if let Err(e) = envelope.payload.verify() {
            debug!(from = %envelope.sender, error = %e, "content bloom signature invalid");
            return;
        }
        let bloom = match envelope.payload.decode_body::<ContentBloom>() {
            Ok(body) => body.bloom,
            Err(e) => {
                debug!(from = %envelope.sender, error = %e, "malformed content bloom");
                return;
            }
        };
        let record = match self.peers.get(&signer).await {
            Some(existing) => existing.with_content_bloom(bloom),
            None => Peer::bare(signer).with_content_bloom(bloom),
        };
        trace!(peer = %signer, "content bloom updated");
        self.peers.add_peer(record).await;
    }

    /// Answer a peer request with every matching record we hold, plus the
    /// records closest to each requested fingerprint. The requester's own
    /// record and ours are never echoed back.
    async fn serve_peer_request(&self, envelope: &Envelope, request: PeerRequest) {
        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for key in &request.keys {
            let fingerprint = Fingerprint::new(key.clone());
            if let Some(peer) = self.peers.find_by_fingerprint(&fingerprint).await {
                if seen.insert(peer.public_key) {
                    matches.push(peer);
                }
            }
            for peer in self.peers.closest_peers(&fingerprint).await {
                if seen.insert(peer.public_key) {
                    matches.push(peer);
                }
            }
        }
        matches.retain(|p| {
            p.public_key != self.local.public_key() && p.public_key != envelope.sender
        });
        trace!(requester = %envelope.sender, matches = matches.len(), "serving peer request");
        for peer in matches {
            match Object::from_body(&peer) {
                Ok(object) => self.exchange.reply(object, envelope.sender).await,
                Err(e) => debug!(error = %e, "failed to encode peer record"),
            }
        }
    }

    /// Answer a bloom request with the closest providers we know and our
    /// own signed bloom, if we serve anything.
    async fn serve_bloom_request(&self, envelope: &Envelope, request: ContentBloomRequest) {
        for peer in self.peers.closest_content_providers(&request.bloom).await {
            if peer.public_key == self.local.public_key()
                || peer.public_key == envelope.sender
            {
                continue;
            }
            match Object::from_body(&peer) {
                Ok(object) => self.exchange.reply(object, envelope.sender).await,
                Err(e) => debug!(error = %e, "failed to encode provider record"),
            }
        }

        let bloom = self.local.content_bloom().await;
        if bloom.is_empty() {
            return;
        }
        match Object::from_body(&ContentBloom { bloom }) {
            Ok(mut object) => {
                object.sign(&self.local);
                self.exchange.reply(object, envelope.sender).await;
            }
            Err(e) => debug!(error = %e, "failed to encode content bloom"),
        }
    }
}

#[async_trait]
impl Resolver for Hyperspace {
    async fn resolve(&self, lookup: &Lookup) -> Result<Vec<Peer>, DiscoveryError> {
        match lookup {
            Lookup::Fingerprint(fingerprint) => {
                if let Some(peer) = self.peers.find_by_fingerprint(fingerprint).await {
                    return Ok(vec![peer]);
                }
                self.lookup_peer(fingerprint).await
            }
            Lookup::Content(bloom) => {
                let local_matches: Vec<Peer> = self
                    .peers
                    .find_by_content(bloom)
                    .await
                    .into_iter()
                    .filter(|p| p.public_key != self.local.public_key())
                    .collect();
                if !local_matches.is_empty() {
                    return Ok(local_matches);
                }
                self.lookup_content_providers(bloom).await?;
                Ok(self
                    .peers
                    .find_by_content(bloom)
                    .await
                    .into_iter()
                    .filter(|p| p.public_key != self.local.public_key())
                    .collect())
            }
        }
    }
}

/// Dispatch inbound discovery messages to their handlers.
async fn serve_lookups(hyperspace: Arc<Hyperspace>) {
    let mut requests = hyperspace
        .exchange
        .subscribe(
            EnvelopeFilter::new()
                .object_type(messages::PEER_REQUEST_TYPE)
                .object_type(messages::BLOOM_REQUEST_TYPE)
                .object_type(messages::BLOOM_TYPE),
        )
        .await;
    while let Some(envelope) = requests.next().await {
        match ProtocolMessage::decode(&envelope.payload) {
            Ok(Some(ProtocolMessage::PeerRequest(request))) => {
                hyperspace.serve_peer_request(&envelope, request).await;
            }
            Ok(Some(ProtocolMessage::ContentBloomRequest(request))) => {
                hyperspace.serve_bloom_request(&envelope, request).await;
            }
            Ok(Some(ProtocolMessage::ContentBloom(_))) => {
                hyperspace.apply_bloom(&envelope).await;
            }
            Ok(_) => {}
            Err(e) => debug!(from = %envelope.sender, error = %e, "malformed discovery message"),
        }
    }
}

/// Re-advertise the content bloom whenever local content changes.
async fn track_content_changes(hyperspace: Arc<Hyperspace>) {
    let mut changes = hyperspace.local.subscribe_content_changes();
    loop {
        match changes.recv().await {
            Ok(()) => hyperspace.advertise_content().await,
            Err(broadcast::error::RecvError::Lagged(_)) => {
                hyperspace.advertise_content().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PublicKey;
    use crate::testing::TestNetwork;

    async fn wait_for_record(node: &crate::testing::TestNode, key: &PublicKey) {
        for _ in 0..500 {
            if node.store.get(key).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record for {} never arrived", key);
    }

    #[tokio::test]
    async fn test_bootstrapped_peers_resolve_each_other() {
        crate::testing::init_tracing();
        let network = TestNetwork::new();
        let c = network.node(3, &[]).await;
        let a = network.node(1, &[c.address()]).await;
        let b = network.node(2, &[c.address()]).await;

        // Bootstrap announcements reach C; greetings reach A and B.
        wait_for_record(&c, &a.public_key()).await;
        wait_for_record(&c, &b.public_key()).await;
        wait_for_record(&a, &c.public_key()).await;

        let found = a.discovery.lookup_peer(&b.fingerprint()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].public_key, b.public_key());
        assert_eq!(found[0].addresses, vec![b.address()]);
    }

    #[tokio::test]
    async fn test_content_resolves_from_local_store() {
        let network = TestNetwork::new();
        let a = network.node(1, &[]).await;
        a.local
            .set_content_hashes(["content-x".to_string()])
            .await;
        let b = network.node(2, &[a.address()]).await;

        // A's greeting carries its content bloom.
        wait_for_record(&b, &a.public_key()).await;

        let found = b
            .discovery
            .resolve(&Lookup::Content(Bloom::new(["content-x"])))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].public_key, a.public_key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_providers_resolved_via_relay() {
        let network = TestNetwork::new();
        let c = network.node(3, &[]).await;
        let a = network.node(1, &[c.address()]).await;
        wait_for_record(&c, &a.public_key()).await;

        // A starts serving content after C already knows it; the signed
        // bloom advertisement updates C's record.
        a.local
            .set_content_hashes(["content-x".to_string()])
            .await;
        for _ in 0..500 {
            if let Some(record) = c.store.get(&a.public_key()).await {
                if !record.content_bloom.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // B knows only C; the provider lookup goes through it.
        let b = network.node(2, &[c.address()]).await;
        wait_for_record(&b, &c.public_key()).await;

        let providers = b
            .discovery
            .lookup_content_providers(&Bloom::new(["content-x"]))
            .await
            .unwrap();
        assert_eq!(providers, vec![a.fingerprint()]);
    }

    #[tokio::test]
    async fn test_lookup_without_candidates() {
        let network = TestNetwork::new();
        let lone = network.node(7, &[]).await;
        let other = PublicKey::from_bytes([9u8; 32]).fingerprint();

        let result = lone.discovery.lookup_peer(&other).await;
        assert!(matches!(result, Err(DiscoveryError::NoPeersToAsk)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_window_elapses_empty() {
        let network = TestNetwork::new();
        let a = network.node(1, &[]).await;
        let b = network.node(2, &[a.address()]).await;
        wait_for_record(&b, &a.public_key()).await;

        // A knows nobody matching; the window closes on a negative result.
        let unknown = PublicKey::from_bytes([9u8; 32]).fingerprint();
        let found = b.discovery.lookup_peer(&unknown).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_unsigned_bloom_discarded() {
        let network = TestNetwork::new();
        let node = network.node(1, &[]).await;
        let stranger = PublicKey::from_bytes([9u8; 32]);

        let object = Object::from_body(&ContentBloom {
            bloom: Bloom::new(["x"]),
        })
        .unwrap();
        node.discovery
            .apply_bloom(&Envelope {
                sender: stranger,
                payload: object,
            })
            .await;
        assert!(node.store.get(&stranger).await.is_none());
    }

    #[tokio::test]
    async fn test_signed_bloom_updates_signer_record() {
        let network = TestNetwork::new();
        let node = network.node(1, &[]).await;
        let advertiser = LocalPeer::from_seed(9, vec![]);

        let mut object = Object::from_body(&ContentBloom {
            bloom: Bloom::new(["x"]),
        })
        .unwrap();
        object.sign(&advertiser);
        node.discovery
            .apply_bloom(&Envelope {
                sender: advertiser.public_key(),
                payload: object,
            })
            .await;

        let record = node.store.get(&advertiser.public_key()).await.unwrap();
        assert_eq!(record.content_bloom, Bloom::new(["x"]));
    }
}
