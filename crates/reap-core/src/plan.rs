//! Working sets of one reload cycle.

use std::collections::BTreeSet;

use reap_schema::Digest;

/// The filter, delete and deleted sets plus the excluded tags.
///
/// `filter` only shrinks and `delete` only grows; a digest is never in both.
/// Everything is discarded and rebuilt on reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    /// Top-level digests still eligible for policy evaluation.
    pub filter: BTreeSet<Digest>,
    /// Digests committed for deletion.
    pub delete: BTreeSet<Digest>,
    /// Digests already deleted in this cycle.
    pub deleted: BTreeSet<Digest>,
    /// Tags matched by the exclusion patterns.
    pub exclude_tags: BTreeSet<String>,
}

impl CleanupPlan {
    /// Start a cycle with every known digest as a candidate.
    pub fn new(digests: impl IntoIterator<Item = Digest>) -> Self {
        Self {
            filter: digests.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Remove `digest` from the candidates without scheduling it.
    pub fn trim(&mut self, digest: &Digest) -> bool {
        self.filter.remove(digest)
    }

    /// Move `digest` from the candidates to the delete set. Returns `false`
    /// (and changes nothing) if it was not a candidate.
    pub fn schedule(&mut self, digest: &Digest) -> bool {
        if self.filter.remove(digest) {
            self.delete.insert(digest.clone());
            true
        } else {
            false
        }
    }

    /// Whether `tag` is protected by the exclusion patterns.
    pub fn is_excluded(&self, tag: &str) -> bool {
        self.exclude_tags.contains(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_moves_between_sets() {
        let a = Digest::new("sha256:aa");
        let b = Digest::new("sha256:bb");
        let mut plan = CleanupPlan::new([a.clone(), b.clone()]);

        assert!(plan.schedule(&a));
        assert!(!plan.filter.contains(&a));
        assert!(plan.delete.contains(&a));

        // Not a candidate any more: no-op.
        assert!(!plan.schedule(&a));
        assert!(plan.trim(&b));
        assert!(!plan.schedule(&b));
        assert_eq!(plan.delete.len(), 1);
        assert!(plan.filter.is_empty());
    }
}
