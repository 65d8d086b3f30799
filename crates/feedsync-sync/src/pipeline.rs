use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use feedsync_adapters::{AdapterError, FieldMapper, FixtureUpstream, HttpUpstream, UpstreamSource};
use feedsync_core::{
    CycleSummary, Document, JobRecord, MappingSkipped, ReconciliationPlan, RemovalAction,
    UploadStatus,
};
use feedsync_storage::{
    backup_document, load_document, persist_document, HttpClientConfig, LoadError, LockError,
    LockHandle,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Grouping, GroupingRegistry, SyncConfig};
use crate::eligibility::{EligibilityFilter, FetchedGroup};
use crate::guard::{CorruptionGuard, GuardAlert, GuardDecision};
use crate::hooks::{
    fill_classifications, Classifier, LogNotifier, MirrorUploader, NoopClassifier, NoopUploader,
    Notifier, Uploader,
};
use crate::reconcile::{self, PlanOutcome, Reconciler, ReferenceChange, ReferenceGenerator};

pub const META_LAST_BUILD_DATE: &str = "lastBuildDate";
pub const META_PUBLISHER: &str = "publisher";
pub const META_PUBLISHER_URL: &str = "publisherurl";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("feed lock: {0}")]
    Lock(#[source] LockError),
    #[error("fetching grouping {grouping_id}: {source}")]
    Upstream {
        grouping_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("fetching grouping {grouping_id} timed out after {after:?}")]
    UpstreamTimeout { grouping_id: String, after: Duration },
    #[error("fetch task failed: {0}")]
    Task(String),
    #[error("no feed at {0}")]
    MissingFeed(PathBuf),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    LockContention { waited_ms: u64 },
    DeadlineExceeded { stage: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed { summary: CycleSummary },
    Skipped { reason: SkipReason },
    Blocked { alert: GuardAlert },
}

/// What a cycle would do, computed without the lock and without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct DryRun {
    pub existing_jobs: usize,
    pub fetched: usize,
    pub eligible: usize,
    pub plan: ReconciliationPlan,
    pub skipped: Vec<MappingSkipped>,
    pub removals: Vec<RemovalAction>,
    pub guard: GuardDecision,
}

#[derive(Debug, Clone, Serialize)]
struct CycleReport<'a> {
    summary: &'a CycleSummary,
    plan: &'a ReconciliationPlan,
    feed_path: String,
    feed_sha256: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    groupings: Vec<Grouping>,
    upstream: Arc<dyn UpstreamSource>,
    mapper: FieldMapper,
    eligibility: EligibilityFilter,
    guard: CorruptionGuard,
    notifier: Box<dyn Notifier>,
    uploader: Box<dyn Uploader>,
    classifier: Box<dyn Classifier>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        groupings: Vec<Grouping>,
        upstream: Arc<dyn UpstreamSource>,
        mapper: FieldMapper,
        eligibility: EligibilityFilter,
    ) -> Self {
        let guard = CorruptionGuard::new(config.guard_min_jobs);
        Self {
            config,
            groupings,
            upstream,
            mapper,
            eligibility,
            guard,
            notifier: Box::<LogNotifier>::default(),
            uploader: Box::<NoopUploader>::default(),
            classifier: Box::<NoopClassifier>::default(),
        }
    }

    /// Rules, groupings and upstream from the workspace: HTTP when
    /// `upstream_base_url` is set, fixture files otherwise.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let rules_dir = config.rules_dir();
        let mapper = FieldMapper::from_rules_dir(&rules_dir)?;
        let eligibility = EligibilityFilter::from_rules_dir(&rules_dir)?;
        let groupings = GroupingRegistry::load(&config.groupings_path())?.enabled();

        let upstream: Arc<dyn UpstreamSource> = match &config.upstream_base_url {
            Some(base_url) => Arc::new(HttpUpstream::new(
                base_url.clone(),
                HttpClientConfig {
                    timeout: config.fetch_timeout,
                    user_agent: Some(config.user_agent.clone()),
                    bearer_token: config.upstream_token.clone(),
                    ..Default::default()
                },
            )?),
            None => Arc::new(FixtureUpstream::new(config.fixtures_dir())),
        };

        let mut pipeline = Self::new(config, groupings, upstream, mapper, eligibility);
        if let Some(dir) = pipeline.config.mirror_dir.clone() {
            pipeline.uploader = Box::new(MirrorUploader::new(dir));
        }
        Ok(pipeline)
    }

    pub fn with_hooks(mut self, notifier: Box<dyn Notifier>, uploader: Box<dyn Uploader>) -> Self {
        self.notifier = notifier;
        self.uploader = uploader;
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn upstream_name(&self) -> &'static str {
        self.upstream.name()
    }

    /// One fetch → filter → guard → plan → apply → persist pass.
    pub async fn run_once(&self) -> Result<CycleOutcome, CycleError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_cycle", %run_id, upstream = self.upstream.name());
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<CycleOutcome, CycleError> {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.cycle_budget;

        let lock = match LockHandle::acquire(&self.config.lock_path, self.config.lock_timeout).await {
            Ok(lock) => lock,
            Err(LockError::Timeout { waited, .. }) => {
                tracing::info!(?waited, "feed lock held elsewhere; skipping cycle");
                return Ok(CycleOutcome::Skipped {
                    reason: SkipReason::LockContention {
                        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    },
                });
            }
            Err(err) => return Err(CycleError::Lock(err)),
        };

        let document = self.load_or_empty().await?;
        let filtered = self.eligibility.partition(self.fetch_groups().await?);
        tracing::info!(
            existing = document.len(),
            fetched = filtered.fetched,
            eligible = filtered.eligible.len(),
            "upstream fetched"
        );

        let eligible = filtered.eligible.len();
        if let GuardDecision::Blocked(alert) = self.guard.check(&document, eligible) {
            return self.block(run_id, alert).await;
        }
        let PlanOutcome { plan, skipped } = Reconciler::new(&self.mapper).plan(&document, &filtered.eligible);
        if let GuardDecision::Blocked(alert) = self.guard.check_plan(&document, &plan, eligible) {
            return self.block(run_id, alert).await;
        }
        drop(document);

        if let Some(outcome) = past_deadline(deadline, "upstream removals") {
            return Ok(outcome);
        }
        self.execute_removals(&filtered.actions).await;

        if let Some(outcome) = past_deadline(deadline, "feed write") {
            return Ok(outcome);
        }
        let feed_exists = fs::try_exists(&self.config.feed_path).await.unwrap_or(false);
        let current = self.load_or_empty().await?;
        let references = ReferenceGenerator::new(run_id.to_string());
        let (mut next, applied) = reconcile::apply(current, &plan, &references);
        let classified = fill_classifications(&mut next, self.classifier.as_ref());

        let persisted = if !applied.is_empty() || !classified.is_empty() || !feed_exists {
            self.stamp_metadata(&mut next, Utc::now());
            next.sort_jobs(&self.config.job_order);
            Some(persist_document(&next, &self.config.feed_path).await?)
        } else {
            tracing::info!(jobs = next.len(), "feed unchanged");
            None
        };
        lock.release();

        let upload = match &persisted {
            Some(feed) => self.upload(&feed.path).await,
            None => UploadStatus::NotAttempted,
        };

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched: filtered.fetched,
            eligible: filtered.eligible.len(),
            added: applied.added,
            removed: applied.removed,
            updated: applied.updated,
            classified,
            skipped,
            removals: filtered.actions,
            job_count: next.len(),
            persisted: persisted.is_some(),
            upload,
        };

        if let Err(err) = self.write_reports(&summary, &plan).await {
            tracing::warn!(error = %err, "writing cycle reports failed");
        }
        if summary.persisted {
            if let Err(err) = self.notifier.notify(&summary).await {
                tracing::warn!(error = %err, "cycle notification failed");
            }
        }

        tracing::info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            updated = summary.updated.len(),
            skipped = summary.skipped.len(),
            jobs = summary.job_count,
            persisted = summary.persisted,
            "cycle completed"
        );
        Ok(CycleOutcome::Completed { summary })
    }

    /// Compute the plan a cycle would apply. Takes no lock and changes nothing.
    pub async fn plan_only(&self) -> Result<DryRun, CycleError> {
        let document = self.load_or_empty().await?;
        let filtered = self.eligibility.partition(self.fetch_groups().await?);
        let PlanOutcome { plan, skipped } = Reconciler::new(&self.mapper).plan(&document, &filtered.eligible);
        let guard = match self.guard.check(&document, filtered.eligible.len()) {
            GuardDecision::Proceed => self.guard.check_plan(&document, &plan, filtered.eligible.len()),
            blocked => blocked,
        };
        Ok(DryRun {
            existing_jobs: document.len(),
            fetched: filtered.fetched,
            eligible: filtered.eligible.len(),
            plan,
            skipped,
            removals: filtered.actions,
            guard,
        })
    }

    /// Regenerate reference numbers under the feed lock. An empty `ids`
    /// selects every job.
    pub async fn refresh_reference_numbers(&self, ids: &[String]) -> Result<Vec<ReferenceChange>, CycleError> {
        let lock = LockHandle::acquire(&self.config.lock_path, self.config.lock_timeout)
            .await
            .map_err(CycleError::Lock)?;
        let mut document = load_document(&self.config.feed_path)
            .await?
            .ok_or_else(|| CycleError::MissingFeed(self.config.feed_path.clone()))?;

        let references = ReferenceGenerator::new(format!("refresh:{}", Uuid::new_v4()));
        let changes = reconcile::refresh_reference_numbers(&mut document, ids, &references);
        if !changes.is_empty() {
            self.stamp_metadata(&mut document, Utc::now());
            persist_document(&document, &self.config.feed_path).await?;
        }
        lock.release();
        tracing::info!(refreshed = changes.len(), "reference numbers regenerated");
        Ok(changes)
    }

    async fn load_or_empty(&self) -> Result<Document, CycleError> {
        Ok(load_document(&self.config.feed_path).await?.unwrap_or_default())
    }

    /// Fetch every grouping concurrently. Any failure or timeout aborts the
    /// cycle; remaining fetches are cancelled when the set is dropped.
    async fn fetch_groups(&self) -> Result<Vec<FetchedGroup>, CycleError> {
        let timeout = self.config.fetch_timeout;
        let mut tasks = JoinSet::new();
        for (position, grouping) in self.groupings.iter().cloned().enumerate() {
            let upstream = Arc::clone(&self.upstream);
            tasks.spawn(async move {
                let fetched = tokio::time::timeout(timeout, upstream.fetch_group(&grouping.id)).await;
                (position, grouping, fetched)
            });
        }

        let mut groups = Vec::with_capacity(self.groupings.len());
        while let Some(joined) = tasks.join_next().await {
            let (position, grouping, fetched) = joined.map_err(|err| CycleError::Task(err.to_string()))?;
            let mut records = match fetched {
                Ok(Ok(records)) => records,
                Ok(Err(source)) => {
                    return Err(CycleError::Upstream {
                        grouping_id: grouping.id,
                        source,
                    })
                }
                Err(_) => {
                    return Err(CycleError::UpstreamTimeout {
                        grouping_id: grouping.id,
                        after: timeout,
                    })
                }
            };
            if let Some(company) = grouping.company.as_deref() {
                stamp_company(&mut records, company);
            }
            tracing::debug!(grouping_id = %grouping.id, jobs = records.len(), "grouping fetched");
            groups.push((
                position,
                FetchedGroup {
                    grouping_id: grouping.id,
                    records,
                },
            ));
        }
        groups.sort_by_key(|(position, _)| *position);
        Ok(groups.into_iter().map(|(_, group)| group).collect())
    }

    async fn execute_removals(&self, actions: &[RemovalAction]) {
        for action in actions {
            match self
                .upstream
                .remove_from_group(&action.job_id, &action.grouping_id)
                .await
            {
                Ok(()) => tracing::info!(
                    job_id = %action.job_id,
                    grouping_id = %action.grouping_id,
                    "removed ineligible job upstream"
                ),
                Err(err) => tracing::warn!(
                    job_id = %action.job_id,
                    grouping_id = %action.grouping_id,
                    error = %err,
                    "upstream removal failed"
                ),
            }
        }
    }

    async fn block(&self, run_id: Uuid, mut alert: GuardAlert) -> Result<CycleOutcome, CycleError> {
        tracing::error!(
            reason = %alert.reason,
            existing = alert.existing_jobs,
            eligible = alert.eligible_jobs,
            "corruption guard blocked cycle"
        );
        match backup_document(&self.config.feed_path, &self.config.backup_dir, Utc::now()).await {
            Ok(path) => alert.backup_path = path,
            Err(err) => tracing::warn!(error = %err, "backing up feed failed"),
        }
        if let Err(err) = self.notifier.alert(&alert).await {
            tracing::warn!(error = %err, "guard alert delivery failed");
        }
        if let Err(err) = self.write_report(run_id, "guard_alert.json", &alert).await {
            tracing::warn!(error = %err, "writing guard report failed");
        }
        Ok(CycleOutcome::Blocked { alert })
    }

    async fn upload(&self, path: &Path) -> UploadStatus {
        match self.uploader.upload(path).await {
            Ok(true) => UploadStatus::Uploaded,
            Ok(false) => UploadStatus::Declined,
            Err(err) => {
                tracing::warn!(error = %err, "feed upload failed");
                UploadStatus::Failed {
                    message: format!("{err:#}"),
                }
            }
        }
    }

    fn stamp_metadata(&self, document: &mut Document, at: DateTime<Utc>) {
        if document.metadata_value(META_PUBLISHER).is_none() {
            document.set_metadata(META_PUBLISHER, self.config.publisher.clone());
        }
        if document.metadata_value(META_PUBLISHER_URL).is_none() {
            document.set_metadata(META_PUBLISHER_URL, self.config.publisher_url.clone());
        }
        document.set_metadata(META_LAST_BUILD_DATE, at.to_rfc2822());
    }

    async fn write_reports(&self, summary: &CycleSummary, plan: &ReconciliationPlan) -> Result<()> {
        let feed_sha256 = match fs::read(&self.config.feed_path).await {
            Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
            Err(_) => None,
        };
        let report = CycleReport {
            summary,
            plan,
            feed_path: self.config.feed_path.display().to_string(),
            feed_sha256,
        };
        self.write_report(summary.run_id, "cycle_summary.json", &report)
            .await?;
        if !summary.removals.is_empty() {
            self.write_report(summary.run_id, "removal_audit.json", &summary.removals)
                .await?;
        }
        Ok(())
    }

    async fn write_report<T: Serialize + ?Sized>(&self, run_id: Uuid, name: &str, value: &T) -> Result<PathBuf> {
        let dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(name);
        let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

fn past_deadline(deadline: Instant, stage: &str) -> Option<CycleOutcome> {
    if Instant::now() < deadline {
        return None;
    }
    tracing::warn!(stage, "cycle budget exhausted; stopping before side effects");
    Some(CycleOutcome::Skipped {
        reason: SkipReason::DeadlineExceeded {
            stage: stage.to_string(),
        },
    })
}

fn stamp_company(records: &mut [JobRecord], company: &str) {
    for record in records {
        record.set_default("company", company);
    }
}
