//! Peer identity - keys, fingerprints, and the local node identity
//!
//! Provides:
//! - `PublicKey`: 32-byte ed25519 identity, value-equal, hashable
//! - `Fingerprint`: short derived identifier used for addressing/lookup
//! - `LocalPeer`: the local node's signing key, address list, and
//!   content-hash set with change notifications

use std::collections::BTreeSet;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::bloom::Bloom;
use crate::object::{Object, ObjectError};
use crate::peer::Peer;

/// Number of digest bytes used for a fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Buffer for content-change notifications.
const CONTENT_CHANGE_BUFFER: usize = 16;

/// Error working with keys and signatures
#[derive(Debug, Clone)]
pub enum IdentityError {
    /// The bytes do not form a valid ed25519 public key
    InvalidKey,
    /// The signature is malformed or does not verify
    InvalidSignature,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidKey => write!(f, "invalid public key"),
            IdentityError::InvalidSignature => write!(f, "invalid signature"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// An opaque 32-byte peer identity (ed25519 public key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short derived identifier for this key.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = blake3::hash(&self.0);
        Fingerprint(hex::encode(&digest.as_bytes()[..FINGERPRINT_LEN]))
    }

    /// Verify `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| IdentityError::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| IdentityError::InvalidSignature)?;
        key.verify(message, &sig)
            .map_err(|_| IdentityError::InvalidSignature)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Short derived identifier for a public key, used for addressing/lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Routable address string for this fingerprint.
    pub fn address(&self) -> String {
        format!("peer:{}", self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The local node identity.
///
/// Owns the signing key, the list of addresses the node is reachable on,
/// and the set of content hashes the node can serve. Content changes are
/// broadcast so the discoverer can re-advertise its bloom.
pub struct LocalPeer {
    signing_key: ed25519_dalek::SigningKey,
    public_key: PublicKey,
    addresses: RwLock<Vec<String>>,
    content_hashes: RwLock<BTreeSet<String>>,
    content_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPeer")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl LocalPeer {
    fn from_signing_key(signing_key: ed25519_dalek::SigningKey, addresses: Vec<String>) -> Self {
        let public_key = PublicKey(signing_key.verifying_key().to_bytes());
        let (content_tx, _) = broadcast::channel(CONTENT_CHANGE_BUFFER);
        Self {
            signing_key,
            public_key,
            addresses: RwLock::new(addresses),
            content_hashes: RwLock::new(BTreeSet::new()),
            content_tx,
        }
    }

    /// Generate a fresh random identity.
    pub fn generate(addresses: Vec<String>) -> Self {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key, addresses)
    }

    /// Deterministic identity from a seed byte (testing and simulations).
    pub fn from_seed(seed: u8, addresses: Vec<String>) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        Self::from_signing_key(signing_key, addresses)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key.fingerprint()
    }

    /// Sign `message` with the local key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.addresses.read().await.clone()
    }

    pub async fn add_address(&self, address: impl Into<String>) {
        self.addresses.write().await.push(address.into());
    }

    pub async fn content_hashes(&self) -> Vec<String> {
        self.content_hashes.read().await.iter().cloned().collect()
    }

    /// Replace the content-hash set and notify subscribers.
    pub async fn set_content_hashes(&self, hashes: impl IntoIterator<Item = String>) {
        {
            let mut current = self.content_hashes.write().await;
            *current = hashes.into_iter().collect();
        }
        let _ = self.content_tx.send(());
    }

    /// Add a single content hash and notify subscribers.
    pub async fn add_content_hash(&self, hash: impl Into<String>) {
        self.content_hashes.write().await.insert(hash.into());
        let _ = self.content_tx.send(());
    }

    /// Bloom over the current content-hash set.
    pub async fn content_bloom(&self) -> Bloom {
        let hashes = self.content_hashes.read().await;
        Bloom::new(hashes.iter())
    }

    /// Subscribe to content-hash change notifications.
    pub fn subscribe_content_changes(&self) -> broadcast::Receiver<()> {
        self.content_tx.subscribe()
    }

    /// The local Peer record as currently known.
    pub async fn peer(&self) -> Peer {
        Peer {
            public_key: self.public_key,
            addresses: self.addresses().await,
            content_bloom: self.content_bloom().await,
            certificates: Vec::new(),
            owners: vec![self.public_key],
        }
    }

    /// The local Peer record as a signed object, for gossip and greeting.
    pub async fn signed_peer(&self) -> Result<Object, ObjectError> {
        let mut object = Object::from_body(&self.peer().await)?;
        object.sign(self);
        Ok(object)
    }
}
