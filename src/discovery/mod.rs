//! Peer and content discovery
//!
//! The proximity `store` indexes known peers and ranks them by bloom
//! intersection; the `hyperspace` discoverer answers lookups from the
//! store first and asks the closest known peers over the exchange when
//! that comes up empty. The exchange reaches back into discovery through
//! the [`Resolver`] seam, bound after both services exist.

pub mod hyperspace;
pub mod store;

pub use hyperspace::{Hyperspace, LOOKUP_WINDOW};
pub use store::{ProximityStore, CLOSEST_PEER_COUNT};

use async_trait::async_trait;

use crate::bloom::Bloom;
use crate::identity::Fingerprint;
use crate::object::ObjectError;
use crate::peer::Peer;

/// Error resolving a lookup
#[derive(Debug)]
pub enum DiscoveryError {
    /// No candidate peers to query
    NoPeersToAsk,
    /// Building a lookup message failed
    Object(ObjectError),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::NoPeersToAsk => write!(f, "no peers to ask"),
            DiscoveryError::Object(e) => write!(f, "lookup message failed: {}", e),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<ObjectError> for DiscoveryError {
    fn from(e: ObjectError) -> Self {
        DiscoveryError::Object(e)
    }
}

/// What a send is addressed to.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A single peer, by fingerprint
    Fingerprint(Fingerprint),
    /// Providers of content matching a bloom
    Content(Bloom),
}

/// Recipient resolution seam between the exchange and the discoverer.
///
/// Implementations answer from local knowledge when they can and go to
/// the network otherwise. An empty result is a completed lookup that
/// found nothing, not an error.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, lookup: &Lookup) -> Result<Vec<Peer>, DiscoveryError>;
}
