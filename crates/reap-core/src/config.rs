//! Retention policy settings consumed by the engine.
//!
//! Parsing happens in the CLI; this module only holds the values and checks
//! that they make sense together.

use std::time::Duration;

use tracing::warn;

use crate::error::{CleanupError, Result};
use crate::matcher::TagMatcher;

/// Which retention policies to apply and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Comma-separated patterns of tags to delete.
    pub delete_tags: Option<String>,
    /// Comma-separated patterns of tags that must never be deleted.
    pub exclude_tags: Option<String>,
    /// Treat tag patterns as regular expressions instead of globs.
    pub use_regex: bool,
    /// Only consider versions last updated longer ago than this.
    pub older_than: Option<Duration>,
    /// Delete every untagged top-level version.
    pub delete_untagged: bool,
    /// Delete indexes whose children are all gone.
    pub delete_ghost_images: bool,
    /// Delete indexes with at least one missing child.
    pub delete_partial_images: bool,
    /// Delete referrer artifacts whose parent digest no longer exists.
    pub delete_orphaned_images: bool,
    /// Keep this many of the newest tagged versions.
    pub keep_n_tagged: Option<usize>,
    /// Keep this many of the newest untagged versions.
    pub keep_n_untagged: Option<usize>,
    /// Classify and log, but never mutate the remote store.
    pub dry_run: bool,
    /// Reload and check referential integrity after the run.
    pub validate: bool,
}

impl CleanupConfig {
    /// Check the settings and fill in defaults.
    ///
    /// With no deletion policy at all, `delete_untagged` is switched on.
    /// Overlapping policies are accepted with a warning: `keep_n_untagged`
    /// wins over `delete_untagged`, `delete_partial_images` over
    /// `delete_ghost_images`.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Config`] for unusable settings and
    /// [`CleanupError::Pattern`] if a tag pattern does not compile.
    pub fn validated(mut self) -> Result<Self> {
        let delete = self.delete_matcher()?;
        self.exclude_matcher()?;
        if self.delete_tags.is_some() && delete.is_empty() {
            return Err(CleanupError::Config(
                "delete-tags is set but contains no patterns".to_string(),
            ));
        }
        if self.older_than.is_some_and(|d| d.is_zero()) {
            return Err(CleanupError::Config(
                "older-than must be a positive duration".to_string(),
            ));
        }

        if !self.has_deletion_policy() {
            self.delete_untagged = true;
        }
        if self.keep_n_untagged.is_some() && self.delete_untagged {
            warn!("both keep-n-untagged and delete-untagged are set, keep-n-untagged takes priority");
        }
        if self.delete_ghost_images && self.delete_partial_images {
            warn!("both delete-ghost-images and delete-partial-images are set, delete-partial-images takes priority");
        }
        Ok(self)
    }

    fn has_deletion_policy(&self) -> bool {
        self.delete_tags.is_some()
            || self.delete_untagged
            || self.delete_ghost_images
            || self.delete_partial_images
            || self.delete_orphaned_images
            || self.keep_n_tagged.is_some()
            || self.keep_n_untagged.is_some()
    }

    /// Compiled `delete_tags` matcher (empty when unset).
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Pattern`] if a pattern does not compile.
    pub fn delete_matcher(&self) -> Result<TagMatcher> {
        compile(self.delete_tags.as_deref(), self.use_regex)
    }

    /// Compiled `exclude_tags` matcher (empty when unset).
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Pattern`] if a pattern does not compile.
    pub fn exclude_matcher(&self) -> Result<TagMatcher> {
        compile(self.exclude_tags.as_deref(), self.use_regex)
    }
}

fn compile(patterns: Option<&str>, use_regex: bool) -> Result<TagMatcher> {
    match patterns {
        Some(p) => Ok(TagMatcher::new(p, use_regex)?),
        None => Ok(TagMatcher::none()),
    }
}
