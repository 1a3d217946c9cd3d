use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Query timestamp layout understood by `az acr manifest list-metadata --query`
pub const QUERY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One manifest record as returned by `az acr manifest list-metadata`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub digest: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "imageSize")]
    pub size_bytes: u64,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ImageManifest {
    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn has_digest(&self) -> bool {
        !self.digest.trim().is_empty()
    }
}

/// The frozen cutoff of a run. Everything last updated strictly before
/// `cutoff` is old enough to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionWindow {
    pub cutoff: DateTime<Utc>,
    /// Age argument handed to the bulk purge (`360d`, `90m`, ...)
    pub purge_ago: String,
}

impl RetentionWindow {
    pub fn query_timestamp(&self) -> String {
        self.cutoff.format(QUERY_TIMESTAMP_FORMAT).to_string()
    }

    pub fn is_expired(&self, instant: DateTime<Utc>) -> bool {
        instant < self.cutoff
    }
}

/// Running image references per kube context, plus the contexts that could
/// not be queried.
#[derive(Debug, Clone, Default)]
pub struct ClusterInventory {
    pub images: BTreeMap<String, Vec<String>>,
    pub failed_contexts: Vec<String>,
}

impl ClusterInventory {
    pub fn is_complete(&self) -> bool {
        self.failed_contexts.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.images.values().map(Vec::len).sum()
    }
}

/// A tag of a candidate found running in a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InUseMatch {
    pub tag: String,
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct DeletionCandidate {
    pub manifest: ImageManifest,
    pub in_use: Option<InUseMatch>,
}

impl DeletionCandidate {
    pub fn new(manifest: ImageManifest) -> Self {
        Self {
            manifest,
            in_use: None,
        }
    }
}

/// Result of the eligibility filter over one repository listing
#[derive(Debug, Default)]
pub struct DeletionPlan {
    pub repository: String,
    pub candidates: Vec<DeletionCandidate>,
    /// Old manifests without tags. Itemized deletion leaves them alone;
    /// the bulk purge removes them through `--untagged`.
    pub untagged: Vec<ImageManifest>,
    /// Tagged manifests without a digest, only reachable through bulk purge
    pub undeletable: usize,
    /// Manifests the source returned that were not older than the cutoff
    pub too_recent: usize,
    /// Tagged manifests whose tags all missed the tag pattern
    pub pattern_skipped: usize,
}

impl DeletionPlan {
    /// Candidates not flagged by the safety checker
    pub fn deletable(&self) -> impl Iterator<Item = &DeletionCandidate> {
        self.candidates.iter().filter(|c| c.in_use.is_none())
    }

    pub fn total_bytes(&self) -> u64 {
        self.deletable().map(|c| c.manifest.size_bytes).sum()
    }

    pub fn total_gib(&self) -> f64 {
        self.total_bytes() as f64 / BYTES_PER_GIB
    }
}

/// Parameters of one bulk purge invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRequest {
    pub repository: String,
    pub tag_pattern: String,
    pub ago: String,
    pub untagged: bool,
}

impl PurgeRequest {
    /// The `--filter` argument of `acr purge`
    pub fn filter(&self) -> String {
        format!("{}:{}", self.repository, self.tag_pattern)
    }
}

/// GET /v2/<repo>/tags/list response
#[derive(Debug, Deserialize)]
pub struct TagList {
    pub tags: Option<Vec<String>>,
}

/// GET /v2/<repo>/manifests/<tag> (schema v2)
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    pub fn total_size(&self) -> u64 {
        self.config.iter().chain(&self.layers).map(|d| d.size).sum()
    }
}

#[derive(Debug, Deserialize)]
pub struct Descriptor {
    pub size: u64,
    pub digest: String,
}

/// GET /v2/<repo>/blobs/<config-digest>, the image config holding the created timestamp
#[derive(Debug, Deserialize)]
pub struct ImageConfig {
    pub created: Option<DateTime<Utc>>,
}

/// One tag of a Registry V2 repository resolved to its digest
#[derive(Debug, Clone)]
pub struct TagInfo {
    pub tag: String,
    pub digest: String,
    pub created: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Counters of an executed (or simulated) deletion
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}
