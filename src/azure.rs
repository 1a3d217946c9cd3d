use async_trait::async_trait;
use tracing::info;

use crate::error::AppError;
use crate::models::{ImageManifest, PurgeRequest, RetentionWindow};
use crate::registry::{AccountSwitcher, DeletionExecutor, ManifestSource};
use crate::shell;

const AZ: &str = "az";

/// Azure Container Registry through the `az` CLI
pub struct AzureCli {
    registry: String,
}

impl AzureCli {
    pub fn new(registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
        }
    }

    /// Login server images from this registry are pulled through
    pub fn login_server(&self) -> String {
        format!("{}.azurecr.io", self.registry)
    }

    fn list_metadata_args(&self, repository: &str, window: &RetentionWindow) -> Vec<String> {
        vec![
            "acr".into(),
            "manifest".into(),
            "list-metadata".into(),
            "--name".into(),
            repository.into(),
            "--registry".into(),
            self.registry.clone(),
            "--orderby".into(),
            "time_asc".into(),
            "--query".into(),
            format!("[?lastUpdateTime < '{}']", window.query_timestamp()),
            "--output".into(),
            "json".into(),
        ]
    }

    fn purge_args(&self, request: &PurgeRequest) -> Vec<String> {
        let mut cmd = format!("acr purge --filter '{}' --ago={}", request.filter(), request.ago);
        if request.untagged {
            cmd.push_str(" --untagged");
        }
        vec![
            "acr".into(),
            "run".into(),
            format!("--cmd={}", cmd),
            "--registry".into(),
            self.registry.clone(),
            "/dev/null".into(),
        ]
    }

    fn delete_args(&self, repository: &str, digest: &str) -> Vec<String> {
        vec![
            "acr".into(),
            "repository".into(),
            "delete".into(),
            "--name".into(),
            self.registry.clone(),
            "--image".into(),
            format!("{}@{}", repository, digest),
            "--yes".into(),
        ]
    }
}

pub fn parse_metadata(raw: &str) -> Result<Vec<ImageManifest>, AppError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl ManifestSource for AzureCli {
    async fn list_manifests(
        &self,
        repository: &str,
        window: &RetentionWindow,
    ) -> Result<Vec<ImageManifest>, AppError> {
        let raw = shell::run_capture(AZ, &self.list_metadata_args(repository, window))
            .await
            .map_err(|e| AppError::MetadataFetch {
                repository: repository.to_string(),
                message: e.to_string(),
            })?;
        parse_metadata(&raw)
    }
}

#[async_trait]
impl DeletionExecutor for AzureCli {
    async fn purge(&self, request: &PurgeRequest) -> Result<(), AppError> {
        let args = self.purge_args(request);
        info!("Running: {} {}", AZ, args.join(" "));
        shell::run_streaming(AZ, &args)
            .await
            .map_err(|e| AppError::DeletionExecution {
                target: request.filter(),
                message: e.to_string(),
            })
    }

    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), AppError> {
        shell::run_capture(AZ, &self.delete_args(repository, digest))
            .await
            .map(|_| ())
            .map_err(|e| AppError::DeletionExecution {
                target: format!("{}@{}", repository, digest),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl AccountSwitcher for AzureCli {
    async fn switch_account(&self, subscription: &str) -> Result<(), AppError> {
        let args = vec![
            "account".to_string(),
            "set".to_string(),
            "--subscription".to_string(),
            subscription.to_string(),
        ];
        shell::run_capture(AZ, &args)
            .await
            .map(|_| ())
            .map_err(|e| AppError::AccountSwitch {
                subscription: subscription.to_string(),
                message: format!("{} (are you logged in? az login)", e),
            })
    }
}
