use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, LINK};
use reqwest::{Client, Url};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::{
    ImageConfig, ImageManifest, Manifest, PurgeRequest, RetentionWindow, TagInfo, TagList,
};

const MANIFEST_V2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MAX_CONCURRENT_RESOLVES: usize = 10;

/// Lists the manifests of a repository last updated before the cutoff,
/// oldest first.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn list_manifests(
        &self,
        repository: &str,
        window: &RetentionWindow,
    ) -> Result<Vec<ImageManifest>, AppError>;
}

/// Executes deletions against the registry.
#[async_trait]
pub trait DeletionExecutor: Send + Sync {
    /// One bulk purge by tag pattern and age. Output is streamed to the log.
    async fn purge(&self, request: &PurgeRequest) -> Result<(), AppError>;

    /// Delete a single manifest addressed by digest.
    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), AppError>;
}

/// Selects the cloud account queries run against.
#[async_trait]
pub trait AccountSwitcher: Send + Sync {
    async fn switch_account(&self, subscription: &str) -> Result<(), AppError>;
}

/// Docker Registry HTTP API V2 backend
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
        }
    }

    /// GET /v2/<repo>/tags/list with pagination
    pub async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = format!("{}/v2/{}/tags/list", self.base_url, repo);

        loop {
            debug!("GET {}", url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("Failed to fetch tags for {}", repo))?;

            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("GET tags for {} returned status {}", repo, status);
            }

            let next_link = Self::parse_next_link(&resp);

            let tag_list: TagList = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse tag list for {}", repo))?;

            if let Some(t) = tag_list.tags {
                tags.extend(t);
            }

            match next_link {
                Some(next) => url = self.resolve_url(&next),
                None => break,
            }
        }

        Ok(tags)
    }

    /// HEAD /v2/<repo>/manifests/<tag>, reading the Docker-Content-Digest header
    pub async fn get_digest(&self, repo: &str, tag: &str) -> Result<String> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, tag);
        debug!("HEAD {}", url);
        let resp = self
            .client
            .head(&url)
            .header(ACCEPT, MANIFEST_V2_MEDIA_TYPE)
            .send()
            .await
            .with_context(|| format!("Failed to HEAD manifest for {}:{}", repo, tag))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HEAD manifest for {}:{} returned status {}", repo, tag, status);
        }

        resp.headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .with_context(|| format!("Missing Docker-Content-Digest header for {}:{}", repo, tag))
    }

    pub async fn get_manifest(&self, repo: &str, tag: &str) -> Result<Manifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, tag);
        debug!("GET {}", url);
        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, MANIFEST_V2_MEDIA_TYPE)
            .send()
            .await
            .with_context(|| format!("Failed to GET manifest for {}:{}", repo, tag))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET manifest for {}:{} returned status {}", repo, tag, status);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse manifest for {}:{}", repo, tag))
    }

    pub async fn get_image_config(&self, repo: &str, config_digest: &str) -> Result<ImageConfig> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repo, config_digest);
        debug!("GET {}", url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to GET blob {} for {}", config_digest, repo))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET blob {} for {} returned status {}", config_digest, repo, status);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse image config for {}", repo))
    }

    /// DELETE /v2/<repo>/manifests/<digest>
    pub async fn delete_by_digest(&self, repo: &str, digest: &str) -> Result<()> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, digest);
        debug!("DELETE {}", url);
        let resp = self
            .client
            .delete(&url)
            .header(ACCEPT, MANIFEST_V2_MEDIA_TYPE)
            .send()
            .await
            .with_context(|| format!("Failed to DELETE manifest {} for {}", digest, repo))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("DELETE manifest {} for {} returned status {}", digest, repo, status);
        }

        Ok(())
    }

    /// Resolve a single tag into its digest, created timestamp and size
    pub async fn resolve_tag_info(&self, repo: &str, tag: &str) -> Result<TagInfo> {
        let digest = self.get_digest(repo, tag).await?;
        let manifest = self.get_manifest(repo, tag).await?;

        let created = match &manifest.config {
            Some(config) => match self.get_image_config(repo, &config.digest).await {
                Ok(img_config) => img_config.created,
                Err(e) => {
                    warn!("Could not fetch image config for {}:{}: {:#}", repo, tag, e);
                    None
                }
            },
            None => None,
        };

        Ok(TagInfo {
            tag: tag.to_string(),
            digest,
            created,
            size: manifest.total_size(),
        })
    }

    /// Resolve all tags in a repo with bounded concurrency
    pub async fn resolve_all_tags(&self, repo: &str) -> Result<Vec<TagInfo>> {
        let tags = self.list_tags(repo).await?;
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_RESOLVES));
        let mut handles = Vec::with_capacity(tags.len());

        for tag in tags {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Resolve semaphore closed")?;
            let rc = RegistryClient {
                client: self.client.clone(),
                base_url: self.base_url.clone(),
            };
            let repo = repo.to_string();

            handles.push(tokio::spawn(async move {
                let result = rc.resolve_tag_info(&repo, &tag).await;
                drop(permit);
                (tag, result)
            }));
        }

        // A tag left out here would be missing from the in-use check of its
        // digest, so one failed resolve fails the whole listing.
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            let (tag, result) = handle.await.context("Task join error")?;
            infos.push(result.with_context(|| format!("Failed to resolve {}:{}", repo, tag))?);
        }

        Ok(infos)
    }

    /// Parse the Link header for pagination (next URL)
    fn parse_next_link(resp: &reqwest::Response) -> Option<String> {
        let link = resp.headers().get(LINK)?.to_str().ok()?;
        parse_link_header(link)
    }

    /// Resolve a relative URL path against the base URL
    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

/// `host[:port]` of a registry URL, as it appears in image references
/// pulled from that registry
pub fn url_host(base_url: &str) -> Option<String> {
    let url = Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// `</v2/repo/tags/list?n=100&last=x>; rel="next"` to the bracketed URL
fn parse_link_header(link: &str) -> Option<String> {
    if link.contains("rel=\"next\"") {
        let start = link.find('<')? + 1;
        let end = link.find('>')?;
        Some(link[start..end].to_string())
    } else {
        None
    }
}

/// Fold resolved tags into one manifest per digest, keeping only those
/// created before the cutoff, oldest first. Every tag of a digest stays on
/// its manifest. A digest with no known created time is never expired.
pub fn group_by_digest(infos: Vec<TagInfo>, window: &RetentionWindow) -> Vec<ImageManifest> {
    let mut by_digest: HashMap<String, ImageManifest> = HashMap::new();

    for info in infos {
        let manifest = by_digest
            .entry(info.digest.clone())
            .or_insert_with(|| ImageManifest {
                digest: info.digest.clone(),
                tags: Vec::new(),
                created_time: None,
                last_update_time: None,
                size_bytes: info.size,
            });
        manifest.tags.push(info.tag);
        if info.created > manifest.last_update_time {
            manifest.created_time = info.created;
            manifest.last_update_time = info.created;
        }
    }

    let mut manifests: Vec<ImageManifest> = by_digest
        .into_values()
        .filter(|m| match m.last_update_time {
            Some(updated) => window.is_expired(updated),
            None => {
                debug!("Skipping {} without created time", m.digest);
                false
            }
        })
        .collect();
    for manifest in &mut manifests {
        manifest.tags.sort();
    }
    manifests.sort_by(|a, b| {
        a.last_update_time
            .cmp(&b.last_update_time)
            .then_with(|| a.digest.cmp(&b.digest))
    });
    manifests
}

#[async_trait]
impl ManifestSource for RegistryClient {
    async fn list_manifests(
        &self,
        repository: &str,
        window: &RetentionWindow,
    ) -> Result<Vec<ImageManifest>, AppError> {
        let infos = self
            .resolve_all_tags(repository)
            .await
            .map_err(|e| AppError::MetadataFetch {
                repository: repository.to_string(),
                message: format!("{:#}", e),
            })?;
        Ok(group_by_digest(infos, window))
    }
}

#[async_trait]
impl DeletionExecutor for RegistryClient {
    async fn purge(&self, request: &PurgeRequest) -> Result<(), AppError> {
        Err(AppError::DeletionExecution {
            target: request.filter(),
            message: "bulk purge is not supported by the registry-v2 backend".to_string(),
        })
    }

    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), AppError> {
        self.delete_by_digest(repository, digest)
            .await
            .map_err(|e| AppError::DeletionExecution {
                target: format!("{}@{}", repository, digest),
                message: format!("{:#}", e),
            })
    }
}
