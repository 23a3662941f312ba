//! Hypermesh
//!
//! Object transport and peer/content discovery for content-addressed
//! peer-to-peer networks.
//!
//! This crate provides:
//! - Signed, content-addressed objects moved between identified peers
//! - An exchange with per-recipient outboxes and an inbox envelope bus
//! - Bloom-proximity peer and content-provider discovery (hyperspace)
//! - A pluggable connection seam with an in-process memory transport
//!
//! # Module Structure
//!
//! - `object/`: Wire objects, hashing, signatures, protocol messages
//! - `exchange/`: Send path (outboxes) and receive path (inbox)
//! - `discovery/`: Proximity store and the hyperspace discoverer
//! - `identity`: Keys, fingerprints, and the local node identity
//! - `bloom`: The hash-chunk bloom filter proximity is ranked by
//! - `net/`: Transport and connection traits, memory implementation
//! - `store`: Object store seam for serving object requests
//! - `testing/`: Multi-node test networks and failing transports
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hypermesh::{
//!     Exchange, ExchangeConfig, Hyperspace, LocalPeer, Lookup, Object,
//!     ProximityStore, SendOptions,
//! };
//!
//! let local = Arc::new(LocalPeer::generate(vec!["quic:host:4001".into()]));
//! let peers = Arc::new(ProximityStore::new());
//! let exchange = Exchange::start(
//!     local.clone(), transport, peers.clone(), objects, ExchangeConfig::default(),
//! ).await;
//! let discovery = Hyperspace::start(
//!     local, exchange.clone(), peers, bootstrap_addresses,
//! ).await;
//!
//! // Send an object to a peer by fingerprint
//! let report = exchange.send(
//!     Object::new("app/ping", b"hello".to_vec()),
//!     Lookup::Fingerprint(fingerprint),
//!     SendOptions::new(),
//! ).await?;
//! ```

pub mod bloom;
pub mod discovery;
pub mod exchange;
pub mod identity;
pub mod net;
pub mod object;
pub mod peer;
pub mod store;
pub mod testing;

// Re-export main API types for convenience
pub use bloom::Bloom;
pub use discovery::{
    DiscoveryError,
    Hyperspace,
    Lookup,
    ProximityStore,
    Resolver,
};
pub use exchange::{
    Envelope,
    EnvelopeFilter,
    Exchange,
    ExchangeConfig,
    ExchangeError,
    SendError,
    SendOptions,
    SendReport,
    Subscription,
};
pub use identity::{Fingerprint, LocalPeer, PublicKey};
pub use object::{Object, ObjectError, ObjectHash};
pub use peer::Peer;
pub use store::{MemoryObjectStore, ObjectStore};
