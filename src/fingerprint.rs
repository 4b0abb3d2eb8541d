//! Request fingerprints used as cache keys.
//!
//! A [`Fingerprint`] is the lowercase hex MD5 digest of `resource_key ++ path`.
//! The digest carries no security requirement; it only needs to be stable
//! across processes so the persisted cache stays addressable after restarts.

use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Deterministic identifier of a `(resource_key, path)` download target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a resource key and a path inside it.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_core::Fingerprint;
    ///
    /// let a = Fingerprint::of("https://disk.example/d/abc", "/movie.mkv");
    /// let b = Fingerprint::of("https://disk.example/d/abc", "/movie.mkv");
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_str().len(), 32);
    /// ```
    #[must_use]
    pub fn of(resource_key: &str, path: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(resource_key.as_bytes());
        hasher.update(path.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
