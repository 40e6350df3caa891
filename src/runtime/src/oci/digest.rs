//! Content digests.
//!
//! A digest is `<algorithm>:<hex>`. Every blob or manifest read from a
//! registry is hashed as it streams in and compared against the digest it
//! was requested by; see [`DigestVerifier`].

use std::fmt;
use std::str::FromStr;

use a3s_rebase_core::error::{OciError, Result};
use sha2::{Digest as _, Sha256, Sha512};

/// Hash algorithm named by a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Name as it appears before the colon.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate `<algorithm>:<hex>`.
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| OciError::InvalidDigest(s.to_string()))?;
        let algorithm = match alg {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            _ => return Err(OciError::InvalidDigest(s.to_string())),
        };
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(OciError::InvalidDigest(s.to_string()));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Hex-encoded hash without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check `data` against this digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let mut verifier = DigestVerifier::new(self.clone());
        verifier.update(data);
        verifier.finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hash check for streamed content.
///
/// Feed chunks with [`update`](Self::update) as they arrive; the bytes must
/// not be handed to anyone until [`finish`](Self::finish) returns `Ok`.
pub struct DigestVerifier {
    expected: Digest,
    hasher: Hasher,
}

impl DigestVerifier {
    pub fn new(expected: Digest) -> Self {
        let hasher = match expected.algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self { expected, hasher }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match self.hasher {
            Hasher::Sha256(ref mut h) => h.update(chunk),
            Hasher::Sha512(ref mut h) => h.update(chunk),
        }
    }

    /// Compare the accumulated hash against the expected digest.
    pub fn finish(self) -> Result<()> {
        let hex = match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        if hex == self.expected.hex {
            Ok(())
        } else {
            Err(OciError::DigestMismatch {
                expected: self.expected.to_string(),
                actual: format!("{}:{}", self.expected.algorithm.as_str(), hex),
            })
        }
    }
}
