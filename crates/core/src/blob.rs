//! Blob types and object keys.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix under which all blob objects live in the object store.
pub const BLOB_KEY_PREFIX: &str = "blobs/";

impl ContentHash {
    /// Get the object store key for the blob with this digest.
    ///
    /// The key depends on the digest alone, never on a filename.
    pub fn to_object_key(&self) -> String {
        let hex = self.to_hex();
        format!("{}{}/{}/{}", BLOB_KEY_PREFIX, &hex[..2], &hex[2..4], hex)
    }

    /// Recover the digest from a blob object key.
    ///
    /// Returns `None` for keys that are not well-formed blob keys, such as
    /// staging files or foreign objects sharing the bucket.
    pub fn from_object_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(BLOB_KEY_PREFIX)?;
        let mut parts = rest.split('/');
        let (a, b, hex) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let hash = Self::from_hex(hex).ok()?;
        let canonical = hash.to_hex();
        (a == &canonical[..2] && b == &canonical[2..4] && hex == canonical).then_some(hash)
    }
}

/// Lifecycle state of a blob row in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobState {
    /// Bytes are published and the blob may gain references.
    Live,
    /// The blob hit zero references and its bytes are being removed.
    Reclaiming,
}

impl BlobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Reclaiming => "reclaiming",
        }
    }
}

impl fmt::Display for BlobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "live" => Ok(Self::Live),
            "reclaiming" => Ok(Self::Reclaiming),
            other => Err(crate::Error::InvalidBlobState(other.to_string())),
        }
    }
}

/// What is known about a blob independent of where it is stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub digest: ContentHash,
    pub byte_length: u64,
}

impl BlobInfo {
    pub fn new(digest: ContentHash, byte_length: u64) -> Self {
        Self {
            digest,
            byte_length,
        }
    }

    /// Verify that hashed content matches this blob.
    pub fn verify(&self, actual: &ContentHash, actual_len: u64) -> crate::Result<()> {
        if *actual != self.digest {
            return Err(crate::Error::HashMismatch {
                expected: self.digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        if actual_len != self.byte_length {
            return Err(crate::Error::SizeMismatch {
                expected: self.byte_length,
                actual: actual_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        let hash = ContentHash::compute(b"hello world");
        let hex = hash.to_hex();
        assert_eq!(
            hash.to_object_key(),
            format!("blobs/{}/{}/{}", &hex[..2], &hex[2..4], hex)
        );
    }

    #[test]
    fn test_object_key_parses_back() {
        let hash = ContentHash::compute(b"content");
        assert_eq!(ContentHash::from_object_key(&hash.to_object_key()), Some(hash));
    }

    #[test]
    fn test_from_object_key_rejects_foreign_keys() {
        let hash = ContentHash::compute(b"content");
        let hex = hash.to_hex();
        assert!(ContentHash::from_object_key("other/key").is_none());
        assert!(ContentHash::from_object_key(&format!("blobs/00/00/{hex}")).is_none());
        assert!(
            ContentHash::from_object_key(&format!("{}.tmp.1234", hash.to_object_key())).is_none()
        );
        assert!(ContentHash::from_object_key(&format!("blobs/{hex}")).is_none());
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let info = BlobInfo::new(ContentHash::compute(b"abc"), 3);
        assert!(info.verify(&ContentHash::compute(b"abc"), 3).is_ok());
        assert!(info.verify(&ContentHash::compute(b"abd"), 3).is_err());
        assert!(info.verify(&ContentHash::compute(b"abc"), 4).is_err());
    }

    #[test]
    fn test_blob_state_roundtrip() {
        for state in [BlobState::Live, BlobState::Reclaiming] {
            assert_eq!(state.as_str().parse::<BlobState>().unwrap(), state);
        }
        assert!("gone".parse::<BlobState>().is_err());
    }
}
