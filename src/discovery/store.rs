//! Proximity store - concurrent index of known peers
//!
//! Holds at most one `Peer` per key, last write wins, for the process
//! lifetime. Answers exact-match, certificate-signer, and content-superset
//! queries, and ranks peers by bloom proximity for routing.
//!
//! Ranking note: candidates are ordered by *ascending* intersection count
//! and the first [`CLOSEST_PEER_COUNT`] are kept, i.e. the least-similar
//! peers rank first. Tests pin this literal behavior; see DESIGN.md before
//! changing the sort direction.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::trace;

use crate::bloom::Bloom;
use crate::identity::{Fingerprint, PublicKey};
use crate::peer::Peer;

/// Bound on ranked results.
pub const CLOSEST_PEER_COUNT: usize = 11;

/// Concurrent map of known peers. Never errors; an empty store yields
/// empty results.
#[derive(Default)]
pub struct ProximityStore {
    peers: RwLock<HashMap<PublicKey, Peer>>,
}

impl ProximityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer record, replacing any previous record for the key.
    pub async fn add_peer(&self, peer: Peer) {
        trace!(peer = %peer.public_key, addresses = peer.addresses.len(), "storing peer");
        self.peers.write().await.insert(peer.public_key, peer);
    }

    pub async fn get(&self, key: &PublicKey) -> Option<Peer> {
        self.peers.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Exact-match scan by fingerprint.
    pub async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<Peer> {
        let peers = self.peers.read().await;
        peers
            .values()
            .find(|p| p.fingerprint() == *fingerprint)
            .cloned()
    }

    /// Peers carrying a certificate issued by `signer`.
    pub async fn find_by_public_key(&self, signer: &PublicKey) -> Vec<Peer> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.certified_by(signer))
            .cloned()
            .collect()
    }

    /// Peers whose content bloom is a superset of `query`.
    pub async fn find_by_content(&self, query: &Bloom) -> Vec<Peer> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.content_bloom.contains(query))
            .cloned()
            .collect()
    }

    /// Peers ranked by identity-bloom proximity to a target fingerprint.
    pub async fn closest_peers(&self, target: &Fingerprint) -> Vec<Peer> {
        self.closest_peers_by_bloom(&Bloom::from_key(target.as_str()))
            .await
    }

    /// Peers ranked by identity-bloom intersection with an arbitrary query
    /// bloom. Used as the fallback candidate set for content lookups.
    pub async fn closest_peers_by_bloom(&self, query: &Bloom) -> Vec<Peer> {
        let peers = self.peers.read().await;
        Self::rank(peers.values(), |p| p.key_bloom().intersection_count(query))
    }

    /// Content providers ranked by content-bloom intersection with the
    /// query. Peers advertising no content are not providers.
    pub async fn closest_content_providers(&self, query: &Bloom) -> Vec<Peer> {
        let peers = self.peers.read().await;
        Self::rank(
            peers.values().filter(|p| !p.content_bloom.is_empty()),
            |p| p.content_bloom.intersection_count(query),
        )
    }

    fn rank<'a>(
        peers: impl Iterator<Item = &'a Peer>,
        score: impl Fn(&Peer) -> usize,
    ) -> Vec<Peer> {
        let mut ranked: Vec<(usize, Peer)> = peers.map(|p| (score(p), p.clone())).collect();
        // Ascending intersection count; fingerprint tie-break keeps the
        // ordering deterministic across runs.
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.public_key.cmp(&b.1.public_key))
        });
        ranked.truncate(CLOSEST_PEER_COUNT);
        ranked.into_iter().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Certificate;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_bytes([seed; 32])
    }

    fn peer(seed: u8) -> Peer {
        Peer::new(key(seed), vec![format!("mem:{}", seed)])
    }

    #[tokio::test]
    async fn test_upsert_last_write_wins() {
        let store = ProximityStore::new();
        store.add_peer(peer(1)).await;
        let replacement = Peer::new(key(1), vec!["mem:new".to_string()]);
        store.add_peer(replacement.clone()).await;

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&key(1)).await, Some(replacement));
    }

    #[tokio::test]
    async fn test_empty_store_empty_results() {
        let store = ProximityStore::new();
        assert!(store.find_by_fingerprint(&key(1).fingerprint()).await.is_none());
        assert!(store.find_by_content(&Bloom::from_key("x")).await.is_empty());
        assert!(store.closest_peers(&key(1).fingerprint()).await.is_empty());
    }

    #[tokio::test]
    async fn test_find_by_fingerprint_exact() {
        let store = ProximityStore::new();
        store.add_peer(peer(1)).await;
        store.add_peer(peer(2)).await;

        let found = store.find_by_fingerprint(&key(2).fingerprint()).await;
        assert_eq!(found.map(|p| p.public_key), Some(key(2)));
        assert!(store.find_by_fingerprint(&key(9).fingerprint()).await.is_none());
    }

    #[tokio::test]
    async fn test_find_by_public_key_scans_certificates() {
        let store = ProximityStore::new();
        let mut certified = peer(1);
        certified.certificates.push(Certificate {
            signer: key(9),
            signature: vec![0; 64],
        });
        store.add_peer(certified).await;
        store.add_peer(peer(2)).await;

        let found = store.find_by_public_key(&key(9)).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].public_key, key(1));
    }

    #[tokio::test]
    async fn test_find_by_content_superset_match() {
        let store = ProximityStore::new();
        store
            .add_peer(peer(1).with_content_bloom(Bloom::new(["x", "y", "z"])))
            .await;
        store
            .add_peer(peer(2).with_content_bloom(Bloom::new(["x"])))
            .await;

        let matches = store.find_by_content(&Bloom::new(["x", "y"])).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].public_key, key(1));
    }

    #[tokio::test]
    async fn test_ranking_is_ascending_by_intersection() {
        // Literal "closest" semantics: least-similar peers rank first.
        let store = ProximityStore::new();
        let query = Bloom::new(["x", "y", "z"]);
        store
            .add_peer(peer(1).with_content_bloom(Bloom::new(["x", "y", "z"])))
            .await;
        store
            .add_peer(peer(2).with_content_bloom(Bloom::new(["x"])))
            .await;
        store
            .add_peer(peer(3).with_content_bloom(Bloom::new(["unrelated"])))
            .await;

        let ranked = store.closest_content_providers(&query).await;
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].public_key, key(3));
        assert_eq!(ranked[1].public_key, key(2));
        assert_eq!(ranked[2].public_key, key(1));
    }

    #[tokio::test]
    async fn test_exact_key_match_ranks_last() {
        let store = ProximityStore::new();
        for seed in 1..=5 {
            store.add_peer(peer(seed)).await;
        }
        let target = key(3).fingerprint();
        let ranked = store.closest_peers(&target).await;
        // Full self-intersection is the highest score, so ascending order
        // puts the exact match at the end.
        assert_eq!(ranked.last().map(|p| p.public_key), Some(key(3)));
    }

    #[tokio::test]
    async fn test_ranking_bounded() {
        let store = ProximityStore::new();
        for seed in 1..=(CLOSEST_PEER_COUNT as u8 + 4) {
            store.add_peer(peer(seed)).await;
        }
        let ranked = store.closest_peers(&key(1).fingerprint()).await;
        assert_eq!(ranked.len(), CLOSEST_PEER_COUNT);
    }

    #[tokio::test]
    async fn test_providers_exclude_peers_without_content() {
        let store = ProximityStore::new();
        store.add_peer(peer(1)).await;
        store
            .add_peer(peer(2).with_content_bloom(Bloom::new(["x"])))
            .await;

        let providers = store.closest_content_providers(&Bloom::new(["x"])).await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].public_key, key(2));
    }
}
