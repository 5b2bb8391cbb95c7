//! Content digests (`sha256:<hex>`).
//!
//! A digest is the only identity a blob has. Anything that crosses a trust
//! boundary (registry responses, files on disk) is re-hashed and compared
//! against one of these before it is believed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use vmpull_core::error::{Result, VmError};

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// Validated `sha256:<64 lowercase hex>` digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest string.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| VmError::InvalidReferenceError {
            reference: value.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, hex) = value
            .split_once(':')
            .ok_or_else(|| invalid("digest must have the form algorithm:hex"))?;
        if algorithm != "sha256" {
            return Err(invalid("unsupported digest algorithm"));
        }
        if hex.len() != SHA256_HEX_LEN {
            return Err(invalid("sha256 digest must have 64 hex characters"));
        }
        if !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(invalid("digest must be lowercase hex"));
        }
        Ok(Self(value.to_string()))
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(data))))
    }

    /// Hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form (`sha256_<hex>`).
    pub fn to_path_component(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = VmError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Incremental sha256 over a byte stream.
#[derive(Clone, Default)]
pub struct DigestHasher {
    inner: Sha256,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(format!("{}{}", SHA256_PREFIX, hex::encode(self.inner.finalize())))
    }
}
