//! Content digests and streaming hashing.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A SHA-256 content digest represented as 32 bytes.
///
/// Serializes as lowercase hex, which is also the form exposed to clients
/// as `sha256`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            crate::Error::InvalidHash(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher::new()
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher that also counts the bytes it has seen.
pub struct ContentHasher {
    inner: Sha256,
    len: u64,
}

impl ContentHasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            len: 0,
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a byte stream, consuming it exactly once.
///
/// Returns the digest and the total number of bytes read. The first stream
/// error is returned as-is.
pub async fn hash_stream<S, E>(stream: S) -> Result<(ContentHash, u64), E>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut hasher = ContentHasher::new();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    let len = hasher.len();
    Ok((hasher.finalize(), len))
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_content_hash_known_vector() {
        let hash = ContentHash::compute(b"hello world");
        assert_eq!(hash.to_hex(), HELLO_WORLD);
        assert_eq!(ContentHash::from_hex(HELLO_WORLD).unwrap(), hash);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_from_slice_requires_32_bytes() {
        assert!(ContentHash::from_slice(&[0u8; 31]).is_err());
        let hash = ContentHash::from_slice(&[7u8; 32]).unwrap();
        assert_eq!(hash.as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ContentHash::hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.len(), 11);
        assert_eq!(hasher.finalize(), ContentHash::compute(b"hello world"));
    }

    #[test]
    fn test_serde_uses_hex() {
        let hash = ContentHash::compute(b"hello world");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{HELLO_WORLD}\""));
    }

    #[tokio::test]
    async fn test_hash_stream_ignores_chunking() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"hel")),
            Ok(Bytes::from_static(b"")),
            Ok(Bytes::from_static(b"lo world")),
        ];
        let (hash, len) = hash_stream(futures::stream::iter(chunks)).await.unwrap();
        assert_eq!(hash.to_hex(), HELLO_WORLD);
        assert_eq!(len, 11);
    }

    #[tokio::test]
    async fn test_hash_stream_propagates_error() {
        let chunks: Vec<Result<Bytes, &'static str>> =
            vec![Ok(Bytes::from_static(b"abc")), Err("boom")];
        let result = hash_stream(futures::stream::iter(chunks)).await;
        assert_eq!(result.unwrap_err(), "boom");
    }
}
