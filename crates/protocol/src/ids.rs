use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error returned when a node identity cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("empty node identity")]
    Empty,

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Opaque client-request identifier.
///
/// Stable for the whole life of an operation, including across restarts of
/// the node, so it is also the key under which persisted state is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable identity bytes of a peer node.
///
/// The live connection to a peer is never persisted; this is what survives a
/// restart and is resolved back to a connection on demand. Serialized as a
/// lowercase hex string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(Vec<u8>);

impl NodeIdentity {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decodes an identity from its hex form.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s)?;
        if bytes.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for NodeIdentity {
    /// Short form used in logs: the first 8 bytes in hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        f.write_str(&hex::encode(shown))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({})", self.to_hex())
    }
}

impl Serialize for NodeIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeIdentity::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
