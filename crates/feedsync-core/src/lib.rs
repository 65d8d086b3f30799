//! Core domain model for the ATS → XML job feed synchronizer.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub mod coerce;
pub mod document;

pub use document::{parse, parse_with_stats, serialize, JobOrder, ParseError, ParseStats};

pub const CRATE_NAME: &str = "feedsync-core";

/// Leaf carrying the upstream id of a job.
pub const FIELD_ID: &str = "bhatsid";
pub const FIELD_REFERENCE_NUMBER: &str = "referencenumber";
pub const FIELD_JOB_FUNCTION: &str = "jobfunction";
pub const FIELD_JOB_INDUSTRIES: &str = "jobindustries";
pub const FIELD_SENIORITY_LEVEL: &str = "senioritylevel";

pub const CLASSIFICATION_FIELDS: [&str; 3] =
    [FIELD_JOB_FUNCTION, FIELD_JOB_INDUSTRIES, FIELD_SENIORITY_LEVEL];

/// Write-once fields. Ordinary reconciliation never reads these for change
/// detection and never writes them on an existing job.
pub const STATIC_FIELDS: [&str; 4] = [
    FIELD_REFERENCE_NUMBER,
    FIELD_JOB_FUNCTION,
    FIELD_JOB_INDUSTRIES,
    FIELD_SENIORITY_LEVEL,
];

pub fn is_static_field(name: &str) -> bool {
    STATIC_FIELDS.contains(&name)
}

/// Field name → leaf text. Ordered so diffs and serialization are deterministic.
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("upstream record is not a JSON object")]
    NotAnObject,
    #[error("upstream record has no usable id")]
    MissingId,
}

/// Opaque upstream job as returned by the ATS. The engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub struct JobRecord {
    pub id: String,
    pub fields: JsonMap<String, JsonValue>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, fields: JsonMap<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a JSON object. Numeric ids are stringified.
    pub fn from_value(value: JsonValue) -> Result<Self, RecordError> {
        let JsonValue::Object(fields) = value else {
            return Err(RecordError::NotAnObject);
        };
        let id = fields
            .get("id")
            .and_then(coerce::first_text)
            .ok_or(RecordError::MissingId)?;
        Ok(Self { id, fields })
    }

    /// Walk a nested object path, e.g. `["address", "city"]`.
    pub fn get(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut cur = self.fields.get(*first)?;
        for segment in rest {
            cur = coerce::first_object(cur)?.get(*segment)?;
        }
        Some(cur)
    }

    pub fn text(&self, path: &[&str]) -> Option<String> {
        self.get(path).and_then(coerce::first_text)
    }

    pub fn flag(&self, path: &[&str]) -> Option<bool> {
        self.get(path).and_then(coerce::as_flag)
    }

    /// Insert `value` under `key` only when the record has no usable value there.
    pub fn set_default(&mut self, key: &str, value: &str) {
        let missing = self
            .fields
            .get(key)
            .and_then(coerce::first_text)
            .is_none();
        if missing {
            self.fields
                .insert(key.to_string(), JsonValue::String(value.to_string()));
        }
    }
}

impl TryFrom<JsonValue> for JobRecord {
    type Error = RecordError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<JobRecord> for JsonValue {
    fn from(record: JobRecord) -> Self {
        let mut fields = record.fields;
        fields
            .entry("id".to_string())
            .or_insert(JsonValue::String(record.id));
        JsonValue::Object(fields)
    }
}

/// AI-derived classification. Populated once by an external classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub job_function: String,
    pub job_industries: String,
    pub seniority_level: String,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.job_function.is_empty()
            && self.job_industries.is_empty()
            && self.seniority_level.is_empty()
    }
}

/// One `<job>` element of the published feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub id: String,
    /// Every leaf except the id leaf.
    pub fields: FieldMap,
}

impl DocumentJob {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: FieldMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or_default()
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn reference_number(&self) -> &str {
        self.field(FIELD_REFERENCE_NUMBER)
    }

    pub fn classification(&self) -> Classification {
        Classification {
            job_function: self.field(FIELD_JOB_FUNCTION).to_string(),
            job_industries: self.field(FIELD_JOB_INDUSTRIES).to_string(),
            seniority_level: self.field(FIELD_SENIORITY_LEVEL).to_string(),
        }
    }

    pub fn set_classification(&mut self, classification: &Classification) {
        self.set_field(FIELD_JOB_FUNCTION, classification.job_function.clone());
        self.set_field(FIELD_JOB_INDUSTRIES, classification.job_industries.clone());
        self.set_field(FIELD_SENIORITY_LEVEL, classification.seniority_level.clone());
    }

    /// Static leaves as currently stored, including empty ones.
    pub fn static_fields(&self) -> FieldMap {
        STATIC_FIELDS
            .iter()
            .map(|name| (name.to_string(), self.field(name).to_string()))
            .collect()
    }
}

#[derive(Debug, Error)]
#[error("job id {0} is already present in the document")]
pub struct DuplicateJobId(pub String);

/// The published feed: metadata leaves followed by an ordered, id-unique job list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    root: String,
    metadata: Vec<(String, String)>,
    jobs: Vec<DocumentJob>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::with_root(document::ROOT_ELEMENT)
    }

    pub fn with_root(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            metadata: Vec::new(),
            jobs: Vec::new(),
        }
    }

    /// Build a document, keeping the first job for any repeated id.
    /// Returns the document and the number of dropped duplicates.
    pub fn from_jobs(jobs: impl IntoIterator<Item = DocumentJob>) -> (Self, usize) {
        let mut document = Self::new();
        let mut dropped = 0usize;
        for job in jobs {
            if document.push(job).is_err() {
                dropped += 1;
            }
        }
        (document, dropped)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace a metadata leaf in place, or append it.
    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.metadata.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key.to_string(), value)),
        }
    }

    pub fn jobs(&self) -> &[DocumentJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.iter().any(|j| j.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&DocumentJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DocumentJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Append a job. Rejects ids already present.
    pub fn push(&mut self, job: DocumentJob) -> Result<(), DuplicateJobId> {
        if self.contains(&job.id) {
            return Err(DuplicateJobId(job.id));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<DocumentJob> {
        let idx = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(idx))
    }

    pub fn retain(&mut self, keep: impl FnMut(&DocumentJob) -> bool) {
        self.jobs.retain(keep);
    }

    pub fn jobs_mut(&mut self) -> impl Iterator<Item = &mut DocumentJob> {
        self.jobs.iter_mut()
    }

    pub fn reference_numbers(&self) -> HashSet<&str> {
        self.jobs
            .iter()
            .map(DocumentJob::reference_number)
            .filter(|r| !r.is_empty())
            .collect()
    }

    pub fn sort_jobs(&mut self, order: &JobOrder) {
        match order {
            JobOrder::Insertion => {}
            JobOrder::Id => self.jobs.sort_by(|a, b| compare_ids(&a.id, &b.id)),
            JobOrder::Field(name) => self.jobs.sort_by(|a, b| {
                a.field(name)
                    .cmp(b.field(name))
                    .then_with(|| compare_ids(&a.id, &b.id))
            }),
        }
    }
}

/// Numeric ids compare numerically, everything else lexically.
fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAddition {
    pub id: String,
    /// Mapped non-static leaves.
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: String,
    pub changes: Vec<FieldChange>,
}

impl JobUpdate {
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

/// One upstream id the mapper could not handle; excluded from the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSkipped {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub to_add: Vec<PlannedAddition>,
    pub to_remove: Vec<String>,
    pub to_update: Vec<JobUpdate>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_update.is_empty()
    }

    pub fn added_ids(&self) -> Vec<String> {
        self.to_add.iter().map(|a| a.id.clone()).collect()
    }

    pub fn updated_ids(&self) -> Vec<String> {
        self.to_update.iter().map(|u| u.id.clone()).collect()
    }
}

/// Upstream removal requested by the eligibility filter, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalAction {
    pub job_id: String,
    pub grouping_id: String,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Result of handing the persisted feed to the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadStatus {
    NotAttempted,
    Uploaded,
    Declined,
    Failed { message: String },
}

/// What one reconciliation cycle did. Handed to the notification hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub eligible: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub classified: Vec<String>,
    pub skipped: Vec<MappingSkipped>,
    pub removals: Vec<RemovalAction>,
    pub job_count: usize,
    pub persisted: bool,
    pub upload: UploadStatus,
}

impl CycleSummary {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.classified.is_empty())
    }
}
