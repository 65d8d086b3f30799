//! Collaborator seams: notification, upload and classification.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use feedsync_core::{Classification, CycleSummary, Document, FieldMap};

use crate::guard::GuardAlert;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called after a cycle persisted a changed feed.
    async fn notify(&self, summary: &CycleSummary) -> Result<()>;

    /// Called when the corruption guard blocks a cycle.
    async fn alert(&self, alert: &GuardAlert) -> Result<()>;
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// `Ok(false)` means the uploader declined (e.g. disabled).
    async fn upload(&self, path: &Path) -> Result<bool>;
}

pub trait Classifier: Send + Sync {
    fn classify(&self, job_id: &str, fields: &FieldMap) -> Option<Classification>;
}

/// Emits summaries and alerts as log events.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &CycleSummary) -> Result<()> {
        tracing::info!(
            run_id = %summary.run_id,
            added = summary.added.len(),
            removed = summary.removed.len(),
            updated = summary.updated.len(),
            jobs = summary.job_count,
            "feed updated"
        );
        Ok(())
    }

    async fn alert(&self, alert: &GuardAlert) -> Result<()> {
        tracing::error!(
            reason = %alert.reason,
            existing = alert.existing_jobs,
            eligible = alert.eligible_jobs,
            backup = ?alert.backup_path,
            "feed update blocked"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopUploader;

#[async_trait]
impl Uploader for NoopUploader {
    async fn upload(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }
}

/// Copies the persisted feed into `dir`, atomically.
#[derive(Debug, Clone)]
pub struct MirrorUploader {
    dir: PathBuf,
}

impl MirrorUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Uploader for MirrorUploader {
    async fn upload(&self, path: &Path) -> Result<bool> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading feed {}", path.display()))?;
        let name = path.file_name().context("feed path has no file name")?;
        let target = self.dir.join(name);
        feedsync_storage::write_atomic(&target, &bytes).await?;
        tracing::info!(target = %target.display(), "feed mirrored");
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct NoopClassifier;

impl Classifier for NoopClassifier {
    fn classify(&self, _job_id: &str, _fields: &FieldMap) -> Option<Classification> {
        None
    }
}

/// Ask the classifier about every job whose classification leaves are all
/// empty. Leaves that already hold a value are never overwritten.
pub fn fill_classifications(document: &mut Document, classifier: &dyn Classifier) -> Vec<String> {
    let mut classified = Vec::new();
    for job in document.jobs_mut() {
        if !job.classification().is_empty() {
            continue;
        }
        match classifier.classify(&job.id, &job.fields) {
            Some(classification) if !classification.is_empty() => {
                job.set_classification(&classification);
                classified.push(job.id.clone());
            }
            _ => {}
        }
    }
    classified
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::{DocumentJob, FIELD_JOB_FUNCTION};
    use tempfile::tempdir;

    struct Fixed;

    impl Classifier for Fixed {
        fn classify(&self, _job_id: &str, fields: &FieldMap) -> Option<Classification> {
            fields.get("title").map(|_| Classification {
                job_function: "Engineering".into(),
                job_industries: "IT Services".into(),
                seniority_level: "Mid-Senior level".into(),
            })
        }
    }

    #[test]
    fn classification_only_fills_empty_jobs() {
        let mut fresh = DocumentJob::new("1");
        fresh.set_field("title", "Dev (1)");
        let mut done = DocumentJob::new("2");
        done.set_field("title", "Ops (2)");
        done.set_field(FIELD_JOB_FUNCTION, "Operations");
        let (mut document, _) = Document::from_jobs([fresh, done]);

        let classified = fill_classifications(&mut document, &Fixed);
        assert_eq!(classified, vec!["1"]);
        assert_eq!(document.get("1").unwrap().field(FIELD_JOB_FUNCTION), "Engineering");
        assert_eq!(document.get("2").unwrap().field(FIELD_JOB_FUNCTION), "Operations");
        assert!(fill_classifications(&mut document, &NoopClassifier).is_empty());
    }

    #[tokio::test]
    async fn mirror_uploader_copies_feed() {
        let dir = tempdir().expect("tempdir");
        let feed = dir.path().join("myticas-job-feed.xml");
        std::fs::write(&feed, "<source/>").unwrap();

        let uploader = MirrorUploader::new(dir.path().join("mirror"));
        assert!(uploader.upload(&feed).await.unwrap());
        let copied = std::fs::read_to_string(dir.path().join("mirror").join("myticas-job-feed.xml")).unwrap();
        assert_eq!(copied, "<source/>");
        assert!(!NoopUploader.upload(&feed).await.unwrap());
    }
}
