use clap::ValueEnum;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::{ClusterInventory, DeletionPlan, ImageManifest, InUseMatch};

/// How a running image reference is compared with a candidate tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MatchMode {
    /// `<registry-host>/<repository>:<tag>` must equal the reference
    Exact,
    /// `<repository>:<tag>` must occur somewhere in the reference
    Contains,
}

/// What a live-usage match does to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InUsePolicy {
    /// Fail the whole run on the first match
    Abort,
    /// Flag the matching image and keep it out of the deletion
    Skip,
}

pub struct SafetyChecker<'a> {
    pub inventory: &'a ClusterInventory,
    pub registry_host: &'a str,
    pub repository: &'a str,
    pub match_mode: MatchMode,
    pub policy: InUsePolicy,
}

impl SafetyChecker<'_> {
    /// The first tag (or digest) of `manifest` seen running in any context
    pub fn find_match(&self, manifest: &ImageManifest) -> Option<InUseMatch> {
        let mut needles: Vec<(String, &str)> = manifest
            .tags
            .iter()
            .map(|tag| (self.reference(':', tag), tag.as_str()))
            .collect();
        if manifest.has_digest() {
            needles.push((self.reference('@', &manifest.digest), manifest.digest.as_str()));
        }

        for (context, images) in &self.inventory.images {
            for image in images.iter().filter(|i| !i.is_empty()) {
                for (needle, label) in &needles {
                    let hit = match self.match_mode {
                        MatchMode::Exact => image == needle,
                        MatchMode::Contains => image.contains(needle.as_str()),
                    };
                    if hit {
                        return Some(InUseMatch {
                            tag: label.to_string(),
                            context: context.clone(),
                        });
                    }
                }
            }
        }
        None
    }

    fn reference(&self, separator: char, target: &str) -> String {
        match self.match_mode {
            MatchMode::Exact => format!(
                "{}/{}{}{}",
                self.registry_host, self.repository, separator, target
            ),
            MatchMode::Contains => format!("{}{}{}", self.repository, separator, target),
        }
    }

    /// Cross-check every candidate. Under `Abort` the first match is an
    /// `ImageInUse` error; under `Skip` matches are flagged on the plan.
    /// Returns the number of flagged candidates.
    pub fn check(&self, plan: &mut DeletionPlan) -> Result<usize, AppError> {
        debug!(
            "Checking {} candidates against {} running image references",
            plan.candidates.len(),
            self.inventory.image_count()
        );

        let mut flagged = 0;
        for candidate in &mut plan.candidates {
            let Some(found) = self.find_match(&candidate.manifest) else {
                continue;
            };
            match self.policy {
                InUsePolicy::Abort => {
                    return Err(AppError::ImageInUse {
                        tag: found.tag,
                        context: found.context,
                    });
                }
                InUsePolicy::Skip => {
                    warn!(
                        "[ImageInUseError] {} is running in the k8s context {}; it will not be deleted",
                        found.tag, found.context
                    );
                    candidate.in_use = Some(found);
                    flagged += 1;
                }
            }
        }
        Ok(flagged)
    }

    /// Digest check of the untagged manifests a bulk purge removes. Any
    /// match aborts, whatever the policy.
    pub fn check_untagged(&self, untagged: &[ImageManifest]) -> Result<(), AppError> {
        for manifest in untagged.iter().filter(|m| m.has_digest()) {
            if let Some(found) = self.find_match(manifest) {
                return Err(AppError::ImageInUse {
                    tag: found.tag,
                    context: found.context,
                });
            }
        }
        Ok(())
    }
}
