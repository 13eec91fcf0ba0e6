//! Content digests and the referrer-tag naming convention.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Tags of the form `sha256-<64 hex>` name a referrer artifact of another digest.
static REFERRER_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(sha256)-([0-9a-f]{64})$").expect("static referrer tag regex")
});

/// Errors produced when parsing a [`Digest`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The string has no `<algorithm>:` prefix.
    #[error("Invalid digest '{0}': expected '<algorithm>:<hex>'")]
    MissingAlgorithm(String),

    /// The encoded part is empty or contains non-hex characters.
    #[error("Invalid digest '{0}': encoded part must be lowercase hex")]
    InvalidEncoding(String),
}

/// Content address of a manifest or blob, e.g. `sha256:4f3c...`.
///
/// The full `<algorithm>:<hex>` form is kept, since that is how registries
/// and the package metadata service both spell it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Create a new `Digest` without validation (for data already vetted by a registry).
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Create a validated `Digest`.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] if `s` is not `<algorithm>:<lowercase hex>`.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let Some((algorithm, encoded)) = s.split_once(':') else {
            return Err(DigestError::MissingAlgorithm(s.to_string()));
        };
        if algorithm.is_empty() || !algorithm.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DigestError::MissingAlgorithm(s.to_string()));
        }
        if encoded.is_empty()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(DigestError::InvalidEncoding(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Return the digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The tag under which a referrer/attestation artifact of this digest is
    /// published: the colon is replaced by a hyphen.
    ///
    /// ```
    /// use reap_schema::Digest;
    ///
    /// assert_eq!(Digest::new("sha256:abc").referrer_tag(), "sha256-abc");
    /// ```
    pub fn referrer_tag(&self) -> String {
        self.0.replacen(':', "-", 1)
    }

    /// Recover the parent digest from a referrer-style tag.
    ///
    /// Returns `None` for ordinary tags.
    pub fn from_referrer_tag(tag: &str) -> Option<Self> {
        let caps = REFERRER_TAG.captures(tag)?;
        Some(Self(format!("{}:{}", &caps[1], &caps[2])))
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Digest {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
