use colored::Colorize;

use crate::models::{DeletionCandidate, DeletionPlan, ExecutionSummary};

/// Preview lines for a plan. The same lines are produced for dry and live runs.
pub fn render_plan(plan: &DeletionPlan) -> Vec<String> {
    let mut lines = vec![
        format!("Repository: {}", plan.repository.bold()),
        "─".repeat(60),
    ];

    for candidate in &plan.candidates {
        lines.push(render_candidate(&plan.repository, candidate));
    }

    if !plan.untagged.is_empty() {
        lines.push(format!(
            "  {} untagged manifests left to the untagged purge",
            plan.untagged.len()
        ));
    }
    if plan.undeletable > 0 {
        lines.push(format!(
            "  {} tagged manifests without digest cannot be deleted individually",
            plan.undeletable
        ));
    }
    if plan.pattern_skipped > 0 {
        lines.push(format!(
            "  {} manifests have no tag matching the tag pattern",
            plan.pattern_skipped
        ));
    }

    lines.push(render_totals(plan));
    lines
}

fn render_candidate(repository: &str, candidate: &DeletionCandidate) -> String {
    let manifest = &candidate.manifest;
    let created_str = match &manifest.created_time {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "unknown".to_string(),
    };

    let label = match &candidate.in_use {
        Some(found) => format!("IN USE ({})", found.context).yellow().bold().to_string(),
        None => "DELETE".red().bold().to_string(),
    };

    format!(
        "    [{}] {} {:<30} {} {}",
        label,
        repository,
        manifest.tags.join(","),
        truncate_digest(&manifest.digest).dimmed(),
        created_str.dimmed(),
    )
}

fn render_totals(plan: &DeletionPlan) -> String {
    format!(
        "Found {} docker images with approximately {:.2} GiB worth of data to delete.",
        plan.deletable().count().to_string().red().bold(),
        plan.total_gib()
    )
}

pub fn truncate_digest(digest: &str) -> &str {
    if digest.len() > 19 {
        &digest[..19]
    } else {
        digest
    }
}

pub fn render_summary(summary: &ExecutionSummary, dry_run: bool) -> String {
    let errors = if summary.failed > 0 {
        summary.failed.to_string().red().bold().to_string()
    } else {
        summary.failed.to_string()
    };

    if dry_run {
        format!(
            "{} Would delete {} images, {} skipped",
            "DRY RUN SUMMARY:".yellow().bold(),
            summary.deleted.to_string().red().bold(),
            summary.skipped,
        )
    } else {
        format!(
            "{} Deleted {} images, {} skipped, {} errors",
            "SUMMARY:".bold(),
            summary.deleted.to_string().red().bold(),
            summary.skipped,
            errors
        )
    }
}
