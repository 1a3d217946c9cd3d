use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::ClusterInventory;
use crate::shell;

const KUBECTL: &str = "kubectl";

/// Which kube contexts the safety check looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSelection {
    /// Safety check explicitly bypassed
    None,
    Explicit(Vec<String>),
    /// Every context in the local kubeconfig
    All,
}

impl ContextSelection {
    /// An explicit list wins over `all` when both are given
    pub fn from_flags(contexts: Option<&str>, all_contexts: bool) -> Self {
        let explicit: Vec<String> = contexts
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        if !explicit.is_empty() {
            ContextSelection::Explicit(explicit)
        } else if all_contexts {
            ContextSelection::All
        } else {
            ContextSelection::None
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of all contexts known locally
    async fn list_contexts(&self) -> Result<Vec<String>, AppError>;

    /// Raw whitespace separated image references of running pods
    async fn running_images(&self, context: &str) -> Result<String, AppError>;
}

pub struct Kubectl;

#[async_trait]
impl ClusterApi for Kubectl {
    async fn list_contexts(&self) -> Result<Vec<String>, AppError> {
        let args = vec![
            "config".to_string(),
            "get-contexts".to_string(),
            "-o".to_string(),
            "name".to_string(),
        ];
        let output = shell::run_capture(KUBECTL, &args)
            .await
            .map_err(|e| AppError::ContextResolution(e.to_string()))?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn running_images(&self, context: &str) -> Result<String, AppError> {
        let args = vec![
            "get".to_string(),
            "pods".to_string(),
            "--context".to_string(),
            context.to_string(),
            "--all-namespaces".to_string(),
            "-o".to_string(),
            "jsonpath={.items[*].spec.containers[*].image}".to_string(),
        ];
        shell::run_capture(KUBECTL, &args)
            .await
            .map_err(|e| AppError::ClusterQuery {
                context: context.to_string(),
                message: e.to_string(),
            })
    }
}

/// Split kubectl output into image references. Empty entries are kept.
pub fn parse_images(raw: &str) -> Vec<String> {
    raw.trim_end_matches('\n')
        .split([' ', '\n'])
        .map(str::to_string)
        .collect()
}

/// Resolve the selection into concrete context names. Returns `None` when
/// the check is bypassed.
pub async fn resolve_contexts(
    api: &dyn ClusterApi,
    selection: &ContextSelection,
) -> Result<Option<Vec<String>>, AppError> {
    match selection {
        ContextSelection::None => Ok(None),
        ContextSelection::Explicit(contexts) => Ok(Some(contexts.clone())),
        ContextSelection::All => {
            let contexts = api.list_contexts().await?;
            if contexts.is_empty() {
                return Err(AppError::ContextResolution(
                    "kubeconfig lists no contexts".to_string(),
                ));
            }
            Ok(Some(contexts))
        }
    }
}

/// Query every context concurrently. A failing context is logged and left
/// out of the inventory; it never cancels the others.
pub async fn collect(api: &dyn ClusterApi, contexts: &[String]) -> ClusterInventory {
    info!("Parsing images from the following contexts: {}", contexts.join(","));

    let results = join_all(contexts.iter().map(|context| async move {
        (context.clone(), api.running_images(context).await)
    }))
    .await;

    let mut inventory = ClusterInventory::default();
    for (context, result) in results {
        match result {
            Ok(raw) => {
                inventory
                    .images
                    .entry(context)
                    .or_default()
                    .extend(parse_images(&raw));
            }
            Err(e) => {
                warn!("[{}] {}", e.kind(), e);
                inventory.failed_contexts.push(context);
            }
        }
    }
    inventory
}
