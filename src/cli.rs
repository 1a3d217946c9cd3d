use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use regex::Regex;
use tracing::warn;

use crate::azure::AzureCli;
use crate::duration::{self, RetentionInput};
use crate::error::AppError;
use crate::inventory::ContextSelection;
use crate::orchestrator::{ExecutionMode, RunConfig};
use crate::registry::url_host;
use crate::safety::{InUsePolicy, MatchMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Azure Container Registry through the az CLI
    Azure,
    /// Any Docker Registry HTTP API V2 (itemized mode only)
    RegistryV2,
}

/// regsweep: delete aged images from a registry repository, unless they still run in Kubernetes
#[derive(Parser, Debug)]
#[command(name = "regsweep", version, about)]
pub struct Cli {
    /// Registry name (azure) or base URL (registry-v2)
    #[arg(long, env = "REGSWEEP_REGISTRY")]
    pub registry: String,

    /// Repository in the registry
    #[arg(long, env = "REGSWEEP_REPOSITORY")]
    pub repository: String,

    /// Azure subscription to switch to before any query
    #[arg(long, env = "REGSWEEP_SUBSCRIPTION")]
    pub subscription: Option<String>,

    /// Comma-separated kube contexts; nothing is deleted if a candidate runs in one of them
    #[arg(long, env = "REGSWEEP_CONTEXTS")]
    pub contexts: Option<String>,

    /// Check every context of the local kubeconfig (ignored when --contexts is given)
    #[arg(long, default_value_t = false)]
    pub all_contexts: bool,

    /// Delete images last updated longer ago than this: a number followed by s, m, h or d
    #[arg(long, default_value = "360d")]
    pub ago: String,

    /// Delete images last updated before this date/time
    #[arg(long, conflicts_with = "ago")]
    pub timestamp: Option<String>,

    /// Preview changes without deleting
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Seconds to wait between deletions (itemized mode)
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Purge in one call, or delete every image by digest
    #[arg(long, value_enum, default_value_t = ExecutionMode::Bulk)]
    pub mode: ExecutionMode,

    #[arg(long, value_enum, default_value_t = Backend::Azure)]
    pub backend: Backend,

    /// How running images are matched against candidate tags
    #[arg(long, value_enum, default_value_t = MatchMode::Exact)]
    pub match_mode: MatchMode,

    /// Abort the run or skip the image when a candidate is running
    #[arg(long, value_enum, default_value_t = InUsePolicy::Abort)]
    pub on_in_use: InUsePolicy,

    /// Only consider images with a tag matching this regex
    #[arg(long, default_value = ".*")]
    pub tag_pattern: String,

    /// Registry host used in exact matching (defaults to the login server)
    #[arg(long)]
    pub registry_host: Option<String>,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Validated settings of one run
#[derive(Debug)]
pub struct Settings {
    pub registry: String,
    pub backend: Backend,
    pub subscription: Option<String>,
    pub contexts: ContextSelection,
    pub run: RunConfig,
}

impl Cli {
    /// Validate flags and freeze the retention window against `now`
    pub fn into_settings(self, now: DateTime<Utc>) -> Result<Settings, AppError> {
        let registry = self.registry.trim().to_string();
        let repository = self.repository.trim().to_string();
        if registry.is_empty() || repository.is_empty() {
            return Err(AppError::Config(
                "You must provide the registry and repository".to_string(),
            ));
        }

        let retention = match self.timestamp {
            Some(ts) => RetentionInput::Timestamp(ts),
            None => RetentionInput::Ago(self.ago),
        };
        let window = duration::resolve(&retention, now)?;

        let tag_pattern = Regex::new(&self.tag_pattern)?;

        if self.on_in_use == InUsePolicy::Skip && self.mode == ExecutionMode::Bulk {
            return Err(AppError::Config(
                "--on-in-use skip needs --mode itemized; a bulk purge cannot leave single images out"
                    .to_string(),
            ));
        }

        let subscription = self.subscription.filter(|s| !s.trim().is_empty());
        let default_host = match self.backend {
            Backend::Azure => AzureCli::new(&registry).login_server(),
            Backend::RegistryV2 => {
                if self.mode == ExecutionMode::Bulk {
                    return Err(AppError::Config(
                        "the registry-v2 backend only supports --mode itemized".to_string(),
                    ));
                }
                if subscription.is_some() {
                    return Err(AppError::Config(
                        "--subscription only applies to the azure backend".to_string(),
                    ));
                }
                url_host(&registry).ok_or_else(|| {
                    AppError::Config(format!("registry '{}' is not a valid URL", registry))
                })?
            }
        };

        if self.delay > 0 && self.mode == ExecutionMode::Bulk {
            warn!("--delay has no effect in bulk mode");
        }

        Ok(Settings {
            contexts: ContextSelection::from_flags(self.contexts.as_deref(), self.all_contexts),
            subscription,
            backend: self.backend,
            run: RunConfig {
                repository,
                registry_host: self.registry_host.unwrap_or(default_host),
                window,
                tag_pattern,
                mode: self.mode,
                match_mode: self.match_mode,
                in_use_policy: self.on_in_use,
                dry_run: self.dry_run,
                delay: Duration::from_secs(self.delay),
            },
            registry,
        })
    }
}
