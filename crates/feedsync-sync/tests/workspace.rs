use std::path::{Path, PathBuf};

use feedsync_storage::load_document;
use feedsync_sync::{CycleOutcome, SyncConfig, SyncPipeline};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sandboxed_config(out: &Path) -> SyncConfig {
    let mut config = SyncConfig::for_workspace(workspace_root());
    config.feed_path = out.join("myticas-job-feed.xml");
    config.lock_path = out.join(".feed.lock");
    config.backup_dir = out.join("backups");
    config.reports_dir = out.join("reports");
    config
}

#[tokio::test]
async fn workspace_fixtures_plan_additions_and_removals() {
    let out = tempdir().expect("tempdir");
    let pipeline = SyncPipeline::from_config(sandboxed_config(out.path())).expect("pipeline");
    assert_eq!(pipeline.upstream_name(), "fixture");

    let dry = pipeline.plan_only().await.expect("plan");
    assert_eq!(dry.plan.added_ids(), vec!["34567", "34571", "34602", "35010"]);
    assert!(dry.skipped.is_empty());
    let removals: Vec<_> = dry
        .removals
        .iter()
        .map(|a| (a.job_id.as_str(), a.grouping_id.as_str()))
        .collect();
    assert_eq!(removals, vec![("34580", "1256"), ("35011", "1499")]);
    assert!(!out.path().join("myticas-job-feed.xml").exists());
}

#[tokio::test]
async fn workspace_fixtures_render_expected_leaves() {
    let out = tempdir().expect("tempdir");
    let config = sandboxed_config(out.path());
    let feed_path = config.feed_path.clone();
    let pipeline = SyncPipeline::from_config(config).expect("pipeline");

    match pipeline.run_once().await.expect("cycle") {
        CycleOutcome::Completed { summary } => assert_eq!(summary.job_count, 4),
        other => panic!("expected completed cycle, got {other:?}"),
    }

    let feed = load_document(&feed_path).await.expect("load").expect("feed");
    let java = feed.get("34567").expect("java job");
    assert_eq!(java.field("title"), "Senior Java Developer (34567)");
    assert_eq!(
        java.field("url"),
        "https://apply.myticas.com/34567/Senior%20Java%20Developer/?source=LinkedIn"
    );
    assert_eq!(java.field("assignedrecruiter"), "#LI-RS1");
    assert_eq!(java.field("remotetype"), "Hybrid");
    assert_eq!(
        java.field("description"),
        "<p>Build and maintain Java services for a federal client.</p>"
    );

    let analyst = feed.get("34571").expect("analyst job");
    assert_eq!(analyst.field("title"), "Business Analyst (34571)");
    assert_eq!(analyst.field("jobtype"), "Contract to Hire");
    assert_eq!(analyst.field("assignedrecruiter"), "#LI-MIT");

    let technician = feed.get("35010").expect("technician job");
    assert!(technician.field("company").starts_with("STSI"));
    assert!(technician.field("url").starts_with("https://apply.stsigroup.com/35010/"));
    assert_eq!(technician.field("remotetype"), "On-site");
    assert_eq!(technician.field("jobtype"), "Temporary");

    let architect = feed.get("34602").expect("architect job");
    assert_eq!(architect.field("assignedrecruiter"), "#LI-DW");
    assert_eq!(architect.field("jobtype"), "Full-time");
}
