//! Peer records
//!
//! A `Peer` describes a remote node: its identity key, the ordered list of
//! addresses it is reachable on, and the bloom over the content it can
//! serve. Peers are immutable values; a newer signed record for the same
//! key replaces the old one wholesale in the proximity store.

use serde::{Deserialize, Serialize};

use crate::bloom::Bloom;
use crate::identity::{Fingerprint, PublicKey};
use crate::object::messages;
use crate::object::ObjectBody;

/// A certificate attached to a peer record, naming the key that signed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    /// Key that issued this certificate
    pub signer: PublicKey,
    /// Signature over the subject peer's key
    pub signature: Vec<u8>,
}

/// A known remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// The peer's identity key
    pub public_key: PublicKey,
    /// Ordered addresses the peer is reachable on
    pub addresses: Vec<String>,
    /// Bloom over the content hashes the peer advertises
    pub content_bloom: Bloom,
    /// Certificates issued to this peer
    pub certificates: Vec<Certificate>,
    /// Keys that own this peer
    pub owners: Vec<PublicKey>,
}

impl ObjectBody for Peer {
    const OBJECT_TYPE: &'static str = messages::PEER_TYPE;
}

impl Peer {
    /// A peer with a key and addresses, nothing else known.
    pub fn new(public_key: PublicKey, addresses: Vec<String>) -> Self {
        Self {
            public_key,
            addresses,
            content_bloom: Bloom::default(),
            certificates: Vec::new(),
            owners: Vec::new(),
        }
    }

    /// A peer known only by key. Used when replying over an already-bound
    /// connection where no addresses are needed.
    pub fn bare(public_key: PublicKey) -> Self {
        Self::new(public_key, Vec::new())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key.fingerprint()
    }

    /// Bloom over this peer's identity, used for proximity ranking.
    pub fn key_bloom(&self) -> Bloom {
        Bloom::from_key(self.fingerprint().as_str())
    }

    /// Same record with a replaced content bloom.
    pub fn with_content_bloom(mut self, bloom: Bloom) -> Self {
        self.content_bloom = bloom;
        self
    }

    /// Whether any certificate on this peer was issued by `signer`.
    pub fn certified_by(&self, signer: &PublicKey) -> bool {
        self.certificates.iter().any(|c| c.signer == *signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_bytes([seed; 32])
    }

    #[test]
    fn test_key_bloom_deterministic() {
        let peer = Peer::new(key(1), vec!["mem:a".to_string()]);
        assert_eq!(peer.key_bloom(), peer.key_bloom());
        assert_eq!(peer.key_bloom(), Bloom::from_key(peer.fingerprint().as_str()));
    }

    #[test]
    fn test_certified_by() {
        let mut peer = Peer::new(key(1), vec![]);
        assert!(!peer.certified_by(&key(2)));
        peer.certificates.push(Certificate {
            signer: key(2),
            signature: vec![0; 64],
        });
        assert!(peer.certified_by(&key(2)));
        assert!(!peer.certified_by(&key(3)));
    }

    #[test]
    fn test_peer_object_type() {
        assert_eq!(Peer::OBJECT_TYPE, "nimona.io/discovery/peer");
    }
}
