//! Content-addressed signed objects
//!
//! The generic object model the transport moves around:
//! - `Object`: a self-describing wire value (type string + postcard body)
//!   with an optional object-layer signature
//! - `ObjectHash`: BLAKE3 content hash (signature excluded)
//! - `ObjectBody`: trait for typed bodies with a fixed type string
//!
//! Protocol message bodies live in [`messages`].

pub mod messages;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::{IdentityError, LocalPeer, PublicKey};

/// Error in object encoding, decoding, or verification
#[derive(Debug)]
pub enum ObjectError {
    /// Failed to encode an object or body
    Encode(String),
    /// Failed to decode an object or body
    Decode(String),
    /// Body requested under a different type string than the object carries
    TypeMismatch { expected: String, actual: String },
    /// Object carries no signer or signature
    Unsigned,
    /// Signature did not verify
    InvalidSignature(IdentityError),
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectError::Encode(e) => write!(f, "object encode failed: {}", e),
            ObjectError::Decode(e) => write!(f, "object decode failed: {}", e),
            ObjectError::TypeMismatch { expected, actual } => {
                write!(f, "object type mismatch: expected {}, got {}", expected, actual)
            }
            ObjectError::Unsigned => write!(f, "object is not signed"),
            ObjectError::InvalidSignature(e) => write!(f, "object signature invalid: {}", e),
        }
    }
}

impl std::error::Error for ObjectError {}

impl From<IdentityError> for ObjectError {
    fn from(e: IdentityError) -> Self {
        ObjectError::InvalidSignature(e)
    }
}

/// BLAKE3 content hash of an object (signature excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ObjectHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a hash from its hex rendering.
    pub fn parse(value: &str) -> Result<Self, ObjectError> {
        let bytes = hex::decode(value).map_err(|e| ObjectError::Decode(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ObjectError::Decode("hash must be 32 bytes".to_string()))?;
        Ok(ObjectHash(bytes))
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A typed object body with a fixed wire type string.
pub trait ObjectBody: Serialize + DeserializeOwned {
    const OBJECT_TYPE: &'static str;
}

/// Fields covered by the content hash. The signature is excluded so an
/// object hashes the same before and after signing the same content.
#[derive(Serialize)]
struct HashInput<'a> {
    object_type: &'a str,
    body: &'a [u8],
    signer: &'a Option<PublicKey>,
}

/// A self-describing wire object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    object_type: String,
    body: Vec<u8>,
    signer: Option<PublicKey>,
    signature: Option<Vec<u8>>,
}

impl Object {
    /// Create an unsigned object from raw body bytes.
    pub fn new(object_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            object_type: object_type.into(),
            body,
            signer: None,
            signature: None,
        }
    }

    /// Encode a typed body into an object of its type.
    pub fn from_body<T: ObjectBody>(body: &T) -> Result<Self, ObjectError> {
        let bytes = postcard::to_allocvec(body).map_err(|e| ObjectError::Encode(e.to_string()))?;
        Ok(Self::new(T::OBJECT_TYPE, bytes))
    }

    /// Decode the body as `T`, checking the type string first.
    pub fn decode_body<T: ObjectBody>(&self) -> Result<T, ObjectError> {
        if self.object_type != T::OBJECT_TYPE {
            return Err(ObjectError::TypeMismatch {
                expected: T::OBJECT_TYPE.to_string(),
                actual: self.object_type.clone(),
            });
        }
        postcard::from_bytes(&self.body).map_err(|e| ObjectError::Decode(e.to_string()))
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn signer(&self) -> Option<PublicKey> {
        self.signer
    }

    pub fn is_signed(&self) -> bool {
        self.signer.is_some() && self.signature.is_some()
    }

    /// Content hash over type, body, and signer.
    pub fn hash(&self) -> ObjectHash {
        let input = HashInput {
            object_type: &self.object_type,
            body: &self.body,
            signer: &self.signer,
        };
        // Serializing borrowed primitives into a Vec cannot fail.
        let bytes = postcard::to_allocvec(&input).unwrap_or_default();
        ObjectHash(*blake3::hash(&bytes).as_bytes())
    }

    /// Sign the object with the local identity, setting signer + signature.
    pub fn sign(&mut self, local: &LocalPeer) {
        self.signer = Some(local.public_key());
        let hash = self.hash();
        self.signature = Some(local.sign(hash.as_bytes()));
    }

    /// Verify the object-layer signature against the embedded signer.
    pub fn verify(&self) -> Result<(), ObjectError> {
        let (signer, signature) = match (&self.signer, &self.signature) {
            (Some(signer), Some(signature)) => (signer, signature),
            _ => return Err(ObjectError::Unsigned),
        };
        signer.verify(self.hash().as_bytes(), signature)?;
        Ok(())
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ObjectError> {
        postcard::to_allocvec(self).map_err(|e| ObjectError::Encode(e.to_string()))
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, ObjectError> {
        postcard::from_bytes(bytes).map_err(|e| ObjectError::Decode(e.to_string()))
    }
}
