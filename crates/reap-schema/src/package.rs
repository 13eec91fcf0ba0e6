//! Package versions as listed by the package metadata service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Digest;

/// Identifier the package metadata service assigns to a package version.
pub type VersionId = u64;

/// One version of a container package: an id, the digest it stores and the
/// tags currently pointing at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    /// Metadata-service id, used for deletion.
    pub id: VersionId,
    /// Content digest of the stored manifest.
    pub digest: Digest,
    /// Tags in listing order, without duplicates.
    pub tags: Vec<String>,
    /// Last update time, if the service reported one.
    pub updated_at: Option<DateTime<Utc>>,
}

impl PackageEntry {
    /// Create an entry, dropping repeated tags while keeping first-seen order.
    pub fn new(
        id: VersionId,
        digest: Digest,
        tags: impl IntoIterator<Item = String>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut unique: Vec<String> = Vec::new();
        for tag in tags {
            if !unique.contains(&tag) {
                unique.push(tag);
            }
        }
        Self {
            id,
            digest,
            tags: unique,
            updated_at,
        }
    }

    /// Whether the version carries no tags at all.
    pub fn is_untagged(&self) -> bool {
        self.tags.is_empty()
    }

    /// Whether `tag` points at this version.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
