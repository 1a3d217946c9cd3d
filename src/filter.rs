use regex::Regex;
use tracing::{debug, warn};

use crate::models::{DeletionCandidate, DeletionPlan, ImageManifest, RetentionWindow};
use crate::orchestrator::ExecutionMode;

/// Decides which listed manifests are candidates for deletion
#[derive(Debug)]
pub struct EligibilityFilter<'a> {
    pub window: &'a RetentionWindow,
    pub tag_pattern: &'a Regex,
    pub mode: ExecutionMode,
}

impl EligibilityFilter<'_> {
    /// Apply the filter to a listing, keeping the listing's order
    pub fn apply(&self, repository: &str, manifests: Vec<ImageManifest>) -> DeletionPlan {
        let mut plan = DeletionPlan {
            repository: repository.to_string(),
            ..DeletionPlan::default()
        };

        for manifest in manifests {
            // The source already filtered on the cutoff, but a manifest
            // without a timestamp or at the boundary must not slip through.
            let expired = manifest
                .last_update_time
                .is_some_and(|t| self.window.is_expired(t));
            if !expired {
                debug!(
                    "Skipping {}: last updated {:?}, not before cutoff",
                    manifest.digest, manifest.last_update_time
                );
                plan.too_recent += 1;
                continue;
            }

            if !manifest.is_tagged() {
                plan.untagged.push(manifest);
                continue;
            }

            if !manifest.tags.iter().any(|t| self.tag_pattern.is_match(t)) {
                debug!(
                    "Skipping tags {} (no match for {})",
                    manifest.tags.join(","),
                    self.tag_pattern
                );
                plan.pattern_skipped += 1;
                continue;
            }

            if self.mode == ExecutionMode::Itemized && !manifest.has_digest() {
                warn!(
                    "Tags {} have no digest and cannot be deleted individually",
                    manifest.tags.join(",")
                );
                plan.undeletable += 1;
                continue;
            }

            plan.candidates.push(DeletionCandidate::new(manifest));
        }

        plan
    }
}
