use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use feedsync_core::JobOrder;
use serde::Deserialize;

use crate::guard::DEFAULT_MIN_EXISTING_JOBS;

#[derive(Debug, Clone, Deserialize)]
pub struct GroupingRegistry {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    pub groupings: Vec<Grouping>,
}

/// One upstream job list (tearsheet) the feed draws from.
#[derive(Debug, Clone, Deserialize)]
pub struct Grouping {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Stamped onto records that carry no company of their own.
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl GroupingRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<Grouping> {
        self.groupings.iter().filter(|g| g.enabled).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub feed_path: PathBuf,
    pub lock_path: PathBuf,
    pub backup_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub mirror_dir: Option<PathBuf>,
    pub upstream_base_url: Option<String>,
    pub upstream_token: Option<String>,
    pub user_agent: String,
    pub lock_timeout: Duration,
    pub fetch_timeout: Duration,
    pub cycle_budget: Duration,
    pub guard_min_jobs: usize,
    pub job_order: JobOrder,
    pub publisher: String,
    pub publisher_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    /// Defaults rooted at `workspace_root`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let root = workspace_root.into();
        Self {
            feed_path: root.join("output").join("myticas-job-feed.xml"),
            lock_path: root.join("output").join(".feed.lock"),
            backup_dir: root.join("backups"),
            reports_dir: root.join("reports"),
            mirror_dir: None,
            upstream_base_url: None,
            upstream_token: None,
            user_agent: "feedsync/0.1".to_string(),
            lock_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(60),
            cycle_budget: Duration::from_secs(270),
            guard_min_jobs: DEFAULT_MIN_EXISTING_JOBS,
            job_order: JobOrder::Insertion,
            publisher: "Myticas Consulting".to_string(),
            publisher_url: "https://www.myticas.com".to_string(),
            scheduler_enabled: false,
            sync_cron: "*/5 * * * *".to_string(),
            workspace_root: root,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("FEED_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(root);
        Self {
            feed_path: env_path("FEED_PATH").unwrap_or(defaults.feed_path),
            lock_path: env_path("FEED_LOCK_PATH").unwrap_or(defaults.lock_path),
            backup_dir: env_path("FEED_BACKUP_DIR").unwrap_or(defaults.backup_dir),
            reports_dir: env_path("FEED_REPORTS_DIR").unwrap_or(defaults.reports_dir),
            mirror_dir: env_path("FEED_MIRROR_DIR"),
            upstream_base_url: env_string("UPSTREAM_BASE_URL"),
            upstream_token: env_string("UPSTREAM_TOKEN"),
            user_agent: env_string("FEED_USER_AGENT").unwrap_or(defaults.user_agent),
            lock_timeout: env_secs("FEED_LOCK_TIMEOUT_SECS").unwrap_or(defaults.lock_timeout),
            fetch_timeout: env_secs("FEED_FETCH_TIMEOUT_SECS").unwrap_or(defaults.fetch_timeout),
            cycle_budget: env_secs("FEED_CYCLE_BUDGET_SECS").unwrap_or(defaults.cycle_budget),
            guard_min_jobs: std::env::var("FEED_GUARD_MIN_JOBS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.guard_min_jobs),
            job_order: std::env::var("FEED_JOB_ORDER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.job_order),
            publisher: env_string("FEED_PUBLISHER").unwrap_or(defaults.publisher),
            publisher_url: env_string("FEED_PUBLISHER_URL").unwrap_or(defaults.publisher_url),
            scheduler_enabled: std::env::var("FEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_string("FEED_SYNC_CRON").unwrap_or(defaults.sync_cron),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.workspace_root.join("rules")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures").join("upstream")
    }

    pub fn groupings_path(&self) -> PathBuf {
        self.rules_dir().join("groupings.yaml")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn env_secs(key: &str) -> Option<Duration> {
    env_string(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
