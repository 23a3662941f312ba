//! Protocol message kinds
//!
//! Wire-visible type strings and typed bodies for the discovery and
//! exchange protocols, plus the closed [`ProtocolMessage`] union that maps
//! a type string to its decoder. Adding a message kind is a single-point
//! change here.

use serde::{Deserialize, Serialize};

use crate::bloom::Bloom;
use crate::object::{Object, ObjectBody, ObjectError, ObjectHash};
use crate::peer::Peer;

/// Wire type strings. These must match exactly for interoperability.
pub const PEER_TYPE: &str = "nimona.io/discovery/peer";
pub const PEER_REQUEST_TYPE: &str = "nimona.io/discovery/peer.request";
pub const BLOOM_TYPE: &str = "nimona.io/discovery/hyperspace/bloom";
pub const BLOOM_REQUEST_TYPE: &str = "nimona.io/discovery/hyperspace/bloom.request";
pub const OBJECT_REQUEST_TYPE: &str = "nimona.io/exchange.ObjectRequest";

/// Request for peers matching a set of fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRequest {
    /// Fingerprints being looked up
    pub keys: Vec<String>,
}

impl ObjectBody for PeerRequest {
    const OBJECT_TYPE: &'static str = PEER_REQUEST_TYPE;
}

/// Request for content providers overlapping a query bloom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBloomRequest {
    /// Query bloom built from the wanted content hashes
    pub bloom: Bloom,
}

impl ObjectBody for ContentBloomRequest {
    const OBJECT_TYPE: &'static str = BLOOM_REQUEST_TYPE;
}

/// A content-hash bloom advertisement.
///
/// Carried in a signed object; the handler requires the object-layer
/// signature and signer before applying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBloom {
    /// Bloom over the advertiser's content hashes
    pub bloom: Bloom,
}

impl ObjectBody for ContentBloom {
    const OBJECT_TYPE: &'static str = BLOOM_TYPE;
}

/// Request for an object by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRequest {
    /// Hash of the wanted object
    pub object_hash: ObjectHash,
}

impl ObjectBody for ObjectRequest {
    const OBJECT_TYPE: &'static str = OBJECT_REQUEST_TYPE;
}

/// Closed union over the known protocol message kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Peer(Peer),
    PeerRequest(PeerRequest),
    ContentBloom(ContentBloom),
    ContentBloomRequest(ContentBloomRequest),
    ObjectRequest(ObjectRequest),
}

impl ProtocolMessage {
    /// Decode a protocol message from an object by its type string.
    ///
    /// Returns `Ok(None)` for type strings outside the protocol, so
    /// application payloads pass through untouched.
    pub fn decode(object: &Object) -> Result<Option<Self>, ObjectError> {
        let message = match object.object_type() {
            PEER_TYPE => ProtocolMessage::Peer(object.decode_body()?),
            PEER_REQUEST_TYPE => ProtocolMessage::PeerRequest(object.decode_body()?),
            BLOOM_TYPE => ProtocolMessage::ContentBloom(object.decode_body()?),
            BLOOM_REQUEST_TYPE => ProtocolMessage::ContentBloomRequest(object.decode_body()?),
            OBJECT_REQUEST_TYPE => ProtocolMessage::ObjectRequest(object.decode_body()?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}
