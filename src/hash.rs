//! Strong block hash.
//!
//! MD5 disambiguates weak-hash collisions within a bucket. It is used
//! strictly for block identification, not as a security primitive.

use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// 16-byte strong digest of a block.
///
/// # Example
///
/// ```rust
/// use booster::StrongHash;
///
/// let h1 = StrongHash::compute(b"hello world");
/// let h2 = StrongHash::compute(b"hello world");
/// assert_eq!(h1, h2);
/// assert_ne!(h1, StrongHash::compute(b"different"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongHash([u8; 16]);

impl StrongHash {
    /// Compute the digest of a block.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Build from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongHash({})", hex::encode(self.0))
    }
}
