use std::time::Duration;

use clap::ValueEnum;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::filter::EligibilityFilter;
use crate::models::{ClusterInventory, DeletionPlan, ExecutionSummary, PurgeRequest, RetentionWindow};
use crate::output::{render_plan, render_summary};
use crate::registry::{DeletionExecutor, ManifestSource};
use crate::safety::{InUsePolicy, MatchMode, SafetyChecker};

const CONFIRMATION_TOKEN: &str = "yes";

/// How confirmed deletions are carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// One purge invocation by tag pattern and age
    Bulk,
    /// One delete call per candidate digest, paced by the delay
    Itemized,
}

/// Everything a run decides with, fixed before the run starts
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub repository: String,
    /// Host prefix of image references in exact match mode
    pub registry_host: String,
    pub window: RetentionWindow,
    pub tag_pattern: Regex,
    pub mode: ExecutionMode,
    pub match_mode: MatchMode,
    pub in_use_policy: InUsePolicy,
    pub dry_run: bool,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Planning,
    AwaitingConfirmation,
    Executing,
    Done,
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    NothingToDelete,
    Declined,
    Completed(ExecutionSummary),
}

pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    source: &'a dyn ManifestSource,
    executor: &'a dyn DeletionExecutor,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a RunConfig,
        source: &'a dyn ManifestSource,
        executor: &'a dyn DeletionExecutor,
    ) -> Self {
        Self {
            config,
            source,
            executor,
            state: RunState::Planning,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Plan, confirm and execute. `inventory` is `None` when the in-use
    /// check was bypassed. Any error leaves the orchestrator `Aborted`.
    pub async fn run<R>(
        &mut self,
        inventory: Option<&ClusterInventory>,
        input: R,
    ) -> Result<Outcome, AppError>
    where
        R: AsyncBufRead + Unpin,
    {
        let result = self.drive(inventory, input).await;
        if result.is_err() {
            self.transition(RunState::Aborted);
        }
        result
    }

    async fn drive<R>(
        &mut self,
        inventory: Option<&ClusterInventory>,
        input: R,
    ) -> Result<Outcome, AppError>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some(plan) = self.plan(inventory).await? else {
            self.transition(RunState::Done);
            return Ok(Outcome::NothingToDelete);
        };

        if self.config.dry_run {
            info!("DRY RUN: no changes will be made");
        }
        for line in render_plan(&plan) {
            info!("{}", line);
        }

        self.transition(RunState::AwaitingConfirmation);
        if !self.confirm(input).await {
            info!("Goodbye!");
            self.transition(RunState::Aborted);
            return Ok(Outcome::Declined);
        }

        self.transition(RunState::Executing);
        let summary = self.execute(&plan).await?;
        info!("{}", render_summary(&summary, self.config.dry_run));
        self.transition(RunState::Done);
        Ok(Outcome::Completed(summary))
    }

    /// Fetch, filter and check. `None` means there is nothing to delete.
    pub async fn plan(
        &self,
        inventory: Option<&ClusterInventory>,
    ) -> Result<Option<DeletionPlan>, AppError> {
        let config = self.config;
        let manifests = self
            .source
            .list_manifests(&config.repository, &config.window)
            .await?;

        if manifests.is_empty() {
            info!(
                "No Docker Images found which were last updated before {}",
                config.window.query_timestamp()
            );
            return Ok(None);
        }

        let mut plan = EligibilityFilter {
            window: &config.window,
            tag_pattern: &config.tag_pattern,
            mode: config.mode,
        }
        .apply(&config.repository, manifests);

        match inventory {
            Some(inventory) => {
                if !inventory.is_complete() {
                    warn!(
                        "Image inventory is incomplete, contexts not checked: {}",
                        inventory.failed_contexts.join(",")
                    );
                }
                // A purge cannot leave single images out, so bulk always aborts.
                let policy = match config.mode {
                    ExecutionMode::Bulk => InUsePolicy::Abort,
                    ExecutionMode::Itemized => config.in_use_policy,
                };
                let checker = SafetyChecker {
                    inventory,
                    registry_host: &config.registry_host,
                    repository: &config.repository,
                    match_mode: config.match_mode,
                    policy,
                };
                checker.check(&mut plan)?;
                // The purge also removes untagged manifests, which only a
                // digest-pinned reference can still be running.
                if config.mode == ExecutionMode::Bulk {
                    checker.check_untagged(&plan.untagged)?;
                }
            }
            None => warn!("No kube contexts given, skipping the in-use check"),
        }

        let purges_untagged = config.mode == ExecutionMode::Bulk && !plan.untagged.is_empty();
        if plan.deletable().next().is_none() && !purges_untagged {
            info!("Nothing to delete in {}", config.repository);
            return Ok(None);
        }

        Ok(Some(plan))
    }

    async fn confirm<R>(&self, mut input: R) -> bool
    where
        R: AsyncBufRead + Unpin,
    {
        info!("Do you want to perform the deletion? Please answer with {}", CONFIRMATION_TOKEN);

        let mut line = String::new();
        if let Err(e) = input.read_line(&mut line).await {
            warn!("Unable to read user input: {}", e);
            return false;
        }
        line.trim_end_matches(['\r', '\n']) == CONFIRMATION_TOKEN
    }

    async fn execute(&self, plan: &DeletionPlan) -> Result<ExecutionSummary, AppError> {
        match self.config.mode {
            ExecutionMode::Bulk => self.execute_bulk(plan).await,
            ExecutionMode::Itemized => Ok(self.execute_itemized(plan).await),
        }
    }

    async fn execute_bulk(&self, plan: &DeletionPlan) -> Result<ExecutionSummary, AppError> {
        let request = PurgeRequest {
            repository: self.config.repository.clone(),
            tag_pattern: self.config.tag_pattern.as_str().to_string(),
            ago: self.config.window.purge_ago.clone(),
            untagged: true,
        };

        if self.config.dry_run {
            info!(
                "[DRY-RUN] Would purge {} older than {} including untagged manifests",
                request.filter(),
                request.ago
            );
        } else {
            self.executor.purge(&request).await?;
        }

        Ok(ExecutionSummary {
            deleted: plan.deletable().count(),
            failed: 0,
            skipped: 0,
        })
    }

    /// Failures are logged and counted; the loop always runs to the end.
    async fn execute_itemized(&self, plan: &DeletionPlan) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            skipped: plan.candidates.len() - plan.deletable().count(),
            ..ExecutionSummary::default()
        };

        for (index, candidate) in plan.deletable().enumerate() {
            let manifest = &candidate.manifest;
            let target = format!("{}@{}", plan.repository, manifest.digest);

            if self.config.dry_run {
                info!("[DRY-RUN] Would delete {} (tags {})", target, manifest.tags.join(","));
                summary.deleted += 1;
                continue;
            }

            if index > 0 && !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }

            match self
                .executor
                .delete_manifest(&plan.repository, &manifest.digest)
                .await
            {
                Ok(()) => {
                    info!("Deleted {} (tags {})", target, manifest.tags.join(","));
                    summary.deleted += 1;
                }
                Err(e) => {
                    error!("[{}] {}", e.kind(), e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageManifest;
    use async_trait::async_trait;
    use chrono::{Duration as TimeDelta, TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeRegistry {
        manifests: Vec<ImageManifest>,
        fetch_error: bool,
        purge_error: bool,
        failing_digests: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        fn with(manifests: Vec<ImageManifest>) -> Self {
            Self {
                manifests,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ManifestSource for FakeRegistry {
        async fn list_manifests(
            &self,
            repository: &str,
            _window: &RetentionWindow,
        ) -> Result<Vec<ImageManifest>, AppError> {
            if self.fetch_error {
                return Err(AppError::MetadataFetch {
                    repository: repository.to_string(),
                    message: "registry unreachable".to_string(),
                });
            }
            Ok(self.manifests.clone())
        }
    }

    #[async_trait]
    impl DeletionExecutor for FakeRegistry {
        async fn purge(&self, request: &PurgeRequest) -> Result<(), AppError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("purge {} {}", request.filter(), request.ago));
            if self.purge_error {
                return Err(AppError::DeletionExecution {
                    target: request.filter(),
                    message: "acr run exited with 1".to_string(),
                });
            }
            Ok(())
        }

        async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), AppError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {}@{}", repository, digest));
            if self.failing_digests.iter().any(|d| d == digest) {
                return Err(AppError::DeletionExecution {
                    target: digest.to_string(),
                    message: "403 forbidden".to_string(),
                });
            }
            Ok(())
        }
    }

    fn config(mode: ExecutionMode) -> RunConfig {
        RunConfig {
            repository: "api".to_string(),
            registry_host: "contoso.azurecr.io".to_string(),
            window: RetentionWindow {
                cutoff: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                purge_ago: "30d".to_string(),
            },
            tag_pattern: Regex::new(".*").unwrap(),
            mode,
            match_mode: MatchMode::Exact,
            in_use_policy: InUsePolicy::Abort,
            dry_run: false,
            delay: Duration::ZERO,
        }
    }

    fn manifest(digest: &str, tags: &[&str], days_before_cutoff: i64) -> ImageManifest {
        let updated = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            - TimeDelta::days(days_before_cutoff);
        ImageManifest {
            digest: digest.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_time: Some(updated),
            last_update_time: Some(updated),
            size_bytes: 1024,
        }
    }

    fn three_old() -> Vec<ImageManifest> {
        vec![
            manifest("sha256:1", &["v1"], 30),
            manifest("sha256:2", &["v2"], 20),
            manifest("sha256:3", &["v3"], 10),
        ]
    }

    fn inventory(context: &str, images: &[&str]) -> ClusterInventory {
        let mut inv = ClusterInventory::default();
        inv.images.insert(
            context.to_string(),
            images.iter().map(|i| i.to_string()).collect(),
        );
        inv
    }

    #[tokio::test]
    async fn test_itemized_deletes_each_candidate_with_delay() {
        let registry = FakeRegistry::with(three_old());
        let mut cfg = config(ExecutionMode::Itemized);
        cfg.delay = Duration::from_millis(25);
        let inv = inventory("prod", &["contoso.azurecr.io/api:v9", "nginx:1.25"]);

        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let started = Instant::now();
        let outcome = orch.run(Some(&inv), &b"yes\n"[..]).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(
            registry.calls(),
            vec!["delete api@sha256:1", "delete api@sha256:2", "delete api@sha256:3"]
        );
        assert_eq!(
            outcome,
            Outcome::Completed(ExecutionSummary {
                deleted: 3,
                failed: 0,
                skipped: 0
            })
        );
        assert_eq!(orch.state(), RunState::Done);
    }

    #[tokio::test]
    async fn test_in_use_tag_aborts_before_confirmation() {
        let registry = FakeRegistry::with(three_old());
        let cfg = config(ExecutionMode::Itemized);
        let inv = inventory("prod", &["contoso.azurecr.io/api:v2"]);
        let mut input: &[u8] = b"yes\n";

        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let err = orch.run(Some(&inv), &mut input).await.unwrap_err();

        assert!(matches!(err, AppError::ImageInUse { ref tag, ref context } if tag == "v2" && context == "prod"));
        assert!(registry.calls().is_empty());
        assert_eq!(input, b"yes\n", "confirmation must not be read");
        assert_eq!(orch.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_in_use_aborts_bulk_even_with_skip_policy() {
        let registry = FakeRegistry::with(three_old());
        let mut cfg = config(ExecutionMode::Bulk);
        cfg.in_use_policy = InUsePolicy::Skip;
        let inv = inventory("prod", &["contoso.azurecr.io/api:v1"]);

        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let err = orch.run(Some(&inv), &b"yes\n"[..]).await.unwrap_err();
        assert!(matches!(err, AppError::ImageInUse { .. }));
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_skip_policy_leaves_in_use_image_alone() {
        let registry = FakeRegistry::with(three_old());
        let mut cfg = config(ExecutionMode::Itemized);
        cfg.in_use_policy = InUsePolicy::Skip;
        cfg.match_mode = MatchMode::Contains;
        let inv = inventory("prod", &["mirror:5000/api:v2"]);

        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let outcome = orch.run(Some(&inv), &b"yes\n"[..]).await.unwrap();

        assert_eq!(registry.calls(), vec!["delete api@sha256:1", "delete api@sha256:3"]);
        assert_eq!(
            outcome,
            Outcome::Completed(ExecutionSummary {
                deleted: 2,
                failed: 0,
                skipped: 1
            })
        );
    }

    #[tokio::test]
    async fn test_confirmation_requires_exact_yes() {
        for answer in ["no\n", "YES\n", "y\n", " yes\n", "yes please\n", "\n", ""] {
            let registry = FakeRegistry::with(three_old());
            let cfg = config(ExecutionMode::Itemized);
            let mut orch = Orchestrator::new(&cfg, &registry, &registry);

            let outcome = orch.run(None, answer.as_bytes()).await.unwrap();
            assert_eq!(outcome, Outcome::Declined, "answer {answer:?}");
            assert!(registry.calls().is_empty());
            assert_eq!(orch.state(), RunState::Aborted);
        }
    }

    #[tokio::test]
    async fn test_confirmation_accepts_crlf() {
        let registry = FakeRegistry::with(three_old());
        let cfg = config(ExecutionMode::Itemized);
        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let outcome = orch.run(None, &b"yes\r\n"[..]).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_empty_listing_short_circuits() {
        let registry = FakeRegistry::default();
        let cfg = config(ExecutionMode::Bulk);
        let mut input: &[u8] = b"yes\n";

        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let outcome = orch.run(None, &mut input).await.unwrap();

        assert_eq!(outcome, Outcome::NothingToDelete);
        assert_eq!(input, b"yes\n", "no confirmation prompt expected");
        assert!(registry.calls().is_empty());
        assert_eq!(orch.state(), RunState::Done);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts() {
        let registry = FakeRegistry {
            fetch_error: true,
            ..FakeRegistry::default()
        };
        let cfg = config(ExecutionMode::Bulk);
        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let err = orch.run(None, &b"yes\n"[..]).await.unwrap_err();
        assert!(matches!(err, AppError::MetadataFetch { .. }));
        assert_eq!(orch.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_item_failure_does_not_stop_loop() {
        let registry = FakeRegistry {
            failing_digests: vec!["sha256:2".to_string()],
            ..FakeRegistry::with(three_old())
        };
        let cfg = config(ExecutionMode::Itemized);
        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let outcome = orch.run(None, &b"yes\n"[..]).await.unwrap();

        assert_eq!(registry.calls().len(), 3);
        assert_eq!(
            outcome,
            Outcome::Completed(ExecutionSummary {
                deleted: 2,
                failed: 1,
                skipped: 0
            })
        );
        assert_eq!(orch.state(), RunState::Done);
    }

    #[tokio::test]
    async fn test_bulk_issues_single_purge() {
        let registry = FakeRegistry::with(three_old());
        let cfg = config(ExecutionMode::Bulk);
        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        orch.run(None, &b"yes\n"[..]).await.unwrap();
        assert_eq!(registry.calls(), vec!["purge api:.* 30d"]);
    }

    #[tokio::test]
    async fn test_bulk_purge_failure_aborts_run() {
        let registry = FakeRegistry {
            purge_error: true,
            ..FakeRegistry::with(three_old())
        };
        let cfg = config(ExecutionMode::Bulk);
        let mut orch = Orchestrator::new(&cfg, &registry, &registry);

        let result = orch.run(None, &b"yes\n"[..]).await;

        assert!(
            matches!(result, Err(AppError::DeletionExecution { ref target, .. }) if target == "api:.*"),
            "{result:?}"
        );
        assert_eq!(registry.calls(), vec!["purge api:.* 30d"]);
        assert_eq!(orch.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_bulk_aborts_when_untagged_digest_is_running() {
        let registry = FakeRegistry::with(vec![
            manifest("sha256:u", &[], 40),
            manifest("sha256:1", &["v1"], 30),
        ]);
        let cfg = config(ExecutionMode::Bulk);
        let inv = inventory("prod", &["contoso.azurecr.io/api@sha256:u"]);
        let mut input: &[u8] = b"yes\n";

        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        let err = orch.run(Some(&inv), &mut input).await.unwrap_err();

        assert!(
            matches!(err, AppError::ImageInUse { ref tag, ref context } if tag == "sha256:u" && context == "prod"),
            "{err:?}"
        );
        assert!(registry.calls().is_empty());
        assert_eq!(input, b"yes\n", "confirmation must not be read");
        assert_eq!(orch.state(), RunState::Aborted);

        // Itemized mode never deletes untagged manifests, so it proceeds
        let itemized = config(ExecutionMode::Itemized);
        let mut orch = Orchestrator::new(&itemized, &registry, &registry);
        orch.run(Some(&inv), &b"yes\n"[..]).await.unwrap();
        assert_eq!(registry.calls(), vec!["delete api@sha256:1"]);
    }

    #[tokio::test]
    async fn test_bulk_runs_for_untagged_only_listing() {
        let registry = FakeRegistry::with(vec![manifest("sha256:9", &[], 100)]);
        let cfg = config(ExecutionMode::Bulk);
        let mut orch = Orchestrator::new(&cfg, &registry, &registry);
        orch.run(None, &b"yes\n"[..]).await.unwrap();
        assert_eq!(registry.calls(), vec!["purge api:.* 30d"]);

        let itemized = config(ExecutionMode::Itemized);
        let mut orch = Orchestrator::new(&itemized, &registry, &registry);
        assert_eq!(orch.run(None, &b"yes\n"[..]).await.unwrap(), Outcome::NothingToDelete);
    }

    #[tokio::test]
    async fn test_dry_run_previews_identically_and_never_deletes() {
        colored::control::set_override(false);
        for mode in [ExecutionMode::Bulk, ExecutionMode::Itemized] {
            let registry = FakeRegistry::with(three_old());
            let live = config(mode);
            let dry = RunConfig {
                dry_run: true,
                delay: Duration::from_secs(60),
                ..config(mode)
            };

            let live_plan = Orchestrator::new(&live, &registry, &registry)
                .plan(None)
                .await
                .unwrap()
                .unwrap();
            let dry_plan = Orchestrator::new(&dry, &registry, &registry)
                .plan(None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(render_plan(&live_plan), render_plan(&dry_plan));

            let mut orch = Orchestrator::new(&dry, &registry, &registry);
            let outcome = orch.run(None, &b"yes\n"[..]).await.unwrap();
            assert!(registry.calls().is_empty(), "{mode:?} issued calls");
            assert!(matches!(outcome, Outcome::Completed(ref s) if s.deleted == 3));
        }
    }
}
