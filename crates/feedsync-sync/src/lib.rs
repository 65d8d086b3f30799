//! Reconciliation cycle: eligibility, planning, guard, apply, persist.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};

pub mod config;
pub mod eligibility;
pub mod guard;
pub mod hooks;
pub mod pipeline;
pub mod reconcile;

pub use config::{Grouping, GroupingRegistry, SyncConfig};
pub use eligibility::{EligibilityDecision, EligibilityFilter, FetchedGroup, FilterOutcome, IneligibleReason};
pub use guard::{CorruptionGuard, GuardAlert, GuardDecision, GuardReason};
pub use hooks::{
    fill_classifications, Classifier, LogNotifier, MirrorUploader, NoopClassifier, NoopUploader,
    Notifier, Uploader,
};
pub use pipeline::{CycleError, CycleOutcome, DryRun, SkipReason, SyncPipeline};
pub use reconcile::{
    apply, refresh_reference_numbers, ApplyReport, PlanOutcome, Reconciler, ReferenceChange,
    ReferenceGenerator,
};

pub const CRATE_NAME: &str = "feedsync-sync";

pub async fn run_sync_once_from_env() -> Result<CycleOutcome> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env())?;
    Ok(pipeline.run_once().await?)
}

/// One cycle per cron firing. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(CycleOutcome::Completed { summary }) => {
                    tracing::debug!(run_id = %summary.run_id, "scheduled cycle completed")
                }
                Ok(other) => tracing::info!(outcome = ?other, "scheduled cycle did not complete"),
                Err(err) => tracing::error!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Markdown digest of the most recent `runs` cycle reports.
pub fn report_recent_cycles(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Feed Sync Report".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        lines.push(format!("## Run `{run_id}`"));

        let summary_path = dir.path().join("cycle_summary.json");
        let alert_path = dir.path().join("guard_alert.json");
        if summary_path.exists() {
            let value: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&summary_path)
                    .with_context(|| format!("reading {}", summary_path.display()))?,
            )
            .with_context(|| format!("parsing {}", summary_path.display()))?;
            let summary = &value["summary"];
            let count = |key: &str| summary[key].as_array().map(Vec::len).unwrap_or(0);
            lines.push(format!("- added: {}", count("added")));
            lines.push(format!("- removed: {}", count("removed")));
            lines.push(format!("- updated: {}", count("updated")));
            lines.push(format!("- skipped: {}", count("skipped")));
            lines.push(format!("- jobs: {}", summary["job_count"].as_u64().unwrap_or(0)));
            lines.push(format!(
                "- upload: {}",
                summary["upload"]["status"].as_str().unwrap_or("unknown")
            ));
            if let Some(sha) = value["feed_sha256"].as_str() {
                lines.push(format!("- feed sha256: `{sha}`"));
            }
        } else if alert_path.exists() {
            let value: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&alert_path)
                    .with_context(|| format!("reading {}", alert_path.display()))?,
            )
            .with_context(|| format!("parsing {}", alert_path.display()))?;
            lines.push(format!(
                "- BLOCKED: {} ({} existing jobs)",
                value["reason"].as_str().unwrap_or("unknown"),
                value["existing_jobs"].as_u64().unwrap_or(0)
            ));
        }
        if dir.path().join("removal_audit.json").exists() {
            lines.push("- removal audit: `removal_audit.json`".to_string());
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn report_lists_completed_and_blocked_runs() {
        let dir = tempdir().expect("tempdir");
        let done = dir.path().join("run-a");
        std::fs::create_dir_all(&done).unwrap();
        std::fs::write(
            done.join("cycle_summary.json"),
            r#"{"summary":{"added":["1","2"],"removed":[],"updated":["3"],"skipped":[],"job_count":5,"upload":{"status":"declined"}},"feed_sha256":"abc"}"#,
        )
        .unwrap();
        let blocked = dir.path().join("run-b");
        std::fs::create_dir_all(&blocked).unwrap();
        std::fs::write(
            blocked.join("guard_alert.json"),
            r#"{"reason":"empty_upstream","existing_jobs":10}"#,
        )
        .unwrap();

        let report = report_recent_cycles(dir.path(), 10).unwrap();
        assert!(report.contains("- added: 2"));
        assert!(report.contains("- upload: declined"));
        assert!(report.contains("- BLOCKED: empty_upstream (10 existing jobs)"));
    }
}
