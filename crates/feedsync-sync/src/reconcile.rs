//! Plan computation and plan application.
//!
//! `plan` reads the document and never writes it. `apply` is the only place
//! jobs are added, mutated or dropped during a cycle, and it never touches a
//! static leaf of a job that already exists.

use std::collections::HashSet;

use feedsync_adapters::FieldMapper;
use feedsync_core::{
    is_static_field, Document, DocumentJob, FieldChange, FieldMap, JobRecord, JobUpdate,
    MappingSkipped, PlannedAddition, ReconciliationPlan, CLASSIFICATION_FIELDS,
    FIELD_REFERENCE_NUMBER,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

const REFERENCE_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const REFERENCE_LEN: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub plan: ReconciliationPlan,
    pub skipped: Vec<MappingSkipped>,
}

pub struct Reconciler<'a> {
    mapper: &'a FieldMapper,
}

impl<'a> Reconciler<'a> {
    pub fn new(mapper: &'a FieldMapper) -> Self {
        Self { mapper }
    }

    /// Diff the document against the eligible upstream set.
    ///
    /// Repeated upstream ids collapse to their first occurrence. An id the
    /// mapper rejects is recorded as skipped and left exactly as it is in
    /// the document: neither updated nor removed.
    pub fn plan(&self, document: &Document, upstream: &[JobRecord]) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        let mut upstream_ids: HashSet<&str> = HashSet::new();

        for record in upstream {
            if !upstream_ids.insert(record.id.as_str()) {
                continue;
            }
            let mapped = match self.mapper.map_fields(record) {
                Ok(mapped) => mapped,
                Err(err) => {
                    tracing::warn!(job_id = %record.id, error = %err, "skipping unmappable job");
                    outcome.skipped.push(MappingSkipped {
                        id: record.id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            match document.get(&record.id) {
                Some(existing) => {
                    let changes = diff_fields(existing, &mapped);
                    if !changes.is_empty() {
                        outcome.plan.to_update.push(JobUpdate {
                            id: record.id.clone(),
                            changes,
                        });
                    }
                }
                None => outcome.plan.to_add.push(PlannedAddition {
                    id: record.id.clone(),
                    fields: without_static(mapped),
                }),
            }
        }

        outcome.plan.to_remove = document
            .jobs()
            .iter()
            .filter(|job| !upstream_ids.contains(job.id.as_str()))
            .map(|job| job.id.clone())
            .collect();

        outcome
    }
}

/// Changed non-static leaves, in mapped-key order.
fn diff_fields(existing: &DocumentJob, mapped: &FieldMap) -> Vec<FieldChange> {
    mapped
        .iter()
        .filter(|(name, _)| !is_static_field(name))
        .filter(|(name, value)| existing.field(name) != value.as_str())
        .map(|(name, value)| FieldChange {
            field: name.clone(),
            previous: existing.field(name).to_string(),
            current: value.clone(),
        })
        .collect()
}

fn without_static(mut fields: FieldMap) -> FieldMap {
    fields.retain(|name, _| !is_static_field(name));
    fields
}

/// Derives reference numbers: the first `REFERENCE_LEN` base-36 digits of
/// `SHA-256("<seed>:<id>:<attempt>")`, bumping `attempt` until the token is
/// not already taken.
#[derive(Debug, Clone)]
pub struct ReferenceGenerator {
    seed: String,
}

impl ReferenceGenerator {
    pub fn new(seed: impl Into<String>) -> Self {
        Self { seed: seed.into() }
    }

    pub fn generate(&self, id: &str, taken: &HashSet<String>) -> String {
        let mut attempt = 0u32;
        loop {
            let token = self.token(id, attempt);
            if !taken.contains(&token) {
                return token;
            }
            attempt = attempt.wrapping_add(1);
        }
    }

    fn token(&self, id: &str, attempt: u32) -> String {
        let digest = Sha256::digest(format!("{}:{id}:{attempt}", self.seed).as_bytes());
        digest
            .iter()
            .take(REFERENCE_LEN)
            .map(|b| REFERENCE_ALPHABET[usize::from(*b) % REFERENCE_ALPHABET.len()] as char)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub added: Vec<String>,
    /// Additions whose id was already in the document at apply time.
    pub reused: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.reused.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
    }
}

/// Apply a plan to `document`. Existing jobs keep their position; new jobs
/// are appended.
pub fn apply(
    mut document: Document,
    plan: &ReconciliationPlan,
    references: &ReferenceGenerator,
) -> (Document, ApplyReport) {
    let mut report = ApplyReport::default();

    for id in &plan.to_remove {
        if document.remove(id).is_some() {
            report.removed.push(id.clone());
        }
    }

    for update in &plan.to_update {
        let Some(job) = document.get_mut(&update.id) else {
            tracing::debug!(job_id = %update.id, "update target no longer in feed");
            continue;
        };
        for change in &update.changes {
            if !is_static_field(&change.field) {
                job.set_field(change.field.clone(), change.current.clone());
            }
        }
        report.updated.push(update.id.clone());
    }

    let mut taken: HashSet<String> = document
        .reference_numbers()
        .into_iter()
        .map(str::to_string)
        .collect();

    for addition in &plan.to_add {
        if let Some(job) = document.get_mut(&addition.id) {
            for (name, value) in addition.fields.iter().filter(|(n, _)| !is_static_field(n)) {
                job.set_field(name.clone(), value.clone());
            }
            report.reused.push(addition.id.clone());
            continue;
        }

        let mut job = DocumentJob::new(addition.id.clone());
        for (name, value) in addition.fields.iter().filter(|(n, _)| !is_static_field(n)) {
            job.set_field(name.clone(), value.clone());
        }
        let reference = references.generate(&addition.id, &taken);
        job.set_field(FIELD_REFERENCE_NUMBER, reference.clone());
        for field in CLASSIFICATION_FIELDS {
            job.set_field(field, "");
        }
        taken.insert(reference);

        if document.push(job).is_ok() {
            report.added.push(addition.id.clone());
        }
    }

    (document, report)
}

/// One regenerated reference number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceChange {
    pub id: String,
    pub previous: String,
    pub current: String,
}

/// Regenerate reference numbers for `ids` (every job when `ids` is empty).
/// Not part of reconciliation; only the explicit refresh command calls it.
pub fn refresh_reference_numbers(
    document: &mut Document,
    ids: &[String],
    references: &ReferenceGenerator,
) -> Vec<ReferenceChange> {
    let selected: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut taken: HashSet<String> = document
        .reference_numbers()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut changes = Vec::new();
    for job in document.jobs_mut() {
        if !selected.is_empty() && !selected.contains(job.id.as_str()) {
            continue;
        }
        let previous = job.reference_number().to_string();
        let current = references.generate(&job.id, &taken);
        taken.insert(current.clone());
        job.set_field(FIELD_REFERENCE_NUMBER, current.clone());
        changes.push(ReferenceChange {
            id: job.id.clone(),
            previous,
            current,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::{Classification, FIELD_JOB_FUNCTION};
    use serde_json::json;

    fn record(value: serde_json::Value) -> JobRecord {
        JobRecord::from_value(value).unwrap()
    }

    fn upstream(id: u64, title: &str) -> JobRecord {
        record(json!({
            "id": id,
            "title": title,
            "employmentType": "Contract",
            "address": {"city": "Ottawa", "state": "ON", "countryName": "Canada"},
        }))
    }

    fn seeded(mapper: &FieldMapper, records: &[JobRecord]) -> Document {
        let plan = Reconciler::new(mapper).plan(&Document::new(), records).plan;
        apply(Document::new(), &plan, &ReferenceGenerator::new("seed")).0
    }

    #[test]
    fn new_ids_are_added_with_reference_and_empty_classification() {
        let mapper = FieldMapper::default();
        let outcome = Reconciler::new(&mapper).plan(&Document::new(), &[upstream(100, "Engineer")]);
        assert_eq!(outcome.plan.added_ids(), vec!["100"]);
        assert!(outcome.plan.to_add[0].fields.keys().all(|k| !is_static_field(k)));

        let (document, report) = apply(Document::new(), &outcome.plan, &ReferenceGenerator::new("seed"));
        assert_eq!(report.added, vec!["100"]);
        let job = document.get("100").unwrap();
        assert_eq!(job.reference_number().len(), REFERENCE_LEN);
        assert!(job.reference_number().chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(job.classification().is_empty());
        assert_eq!(job.field("title"), "Engineer (100)");
    }

    #[test]
    fn second_plan_over_same_upstream_is_empty() {
        let mapper = FieldMapper::default();
        let records = vec![upstream(1, "A"), upstream(2, "B")];
        let document = seeded(&mapper, &records);
        let outcome = Reconciler::new(&mapper).plan(&document, &records);
        assert!(outcome.plan.is_empty(), "{:?}", outcome.plan);
    }

    #[test]
    fn update_touches_only_changed_non_static_fields() {
        let mapper = FieldMapper::default();
        let mut document = seeded(&mapper, &[upstream(1, "Engineer")]);
        document.get_mut("1").unwrap().set_classification(&Classification {
            job_function: "Engineering".into(),
            job_industries: "Software".into(),
            seniority_level: "Mid".into(),
        });
        let before = document.get("1").unwrap().static_fields();

        let outcome = Reconciler::new(&mapper).plan(&document, &[upstream(1, "Senior Engineer")]);
        assert_eq!(outcome.plan.to_update.len(), 1);
        let changed = outcome.plan.to_update[0].changed_fields();
        assert!(changed.contains(&"title"));
        assert!(changed.iter().all(|f| !is_static_field(f)));

        let (after, report) = apply(document, &outcome.plan, &ReferenceGenerator::new("other"));
        assert_eq!(report.updated, vec!["1"]);
        let job = after.get("1").unwrap();
        assert_eq!(job.field("title"), "Senior Engineer (1)");
        assert_eq!(job.static_fields(), before);
        assert_eq!(job.field(FIELD_JOB_FUNCTION), "Engineering");
    }

    #[test]
    fn missing_upstream_ids_are_removed_in_place() {
        let mapper = FieldMapper::default();
        let document = seeded(&mapper, &[upstream(1, "A"), upstream(2, "B"), upstream(3, "C")]);
        let outcome = Reconciler::new(&mapper).plan(&document, &[upstream(1, "A"), upstream(3, "C")]);
        assert_eq!(outcome.plan.to_remove, vec!["2"]);

        let (after, report) = apply(document, &outcome.plan, &ReferenceGenerator::new("seed"));
        assert_eq!(report.removed, vec!["2"]);
        assert_eq!(after.ids(), vec!["1", "3"]);
    }

    #[test]
    fn duplicate_upstream_ids_keep_first_occurrence() {
        let mapper = FieldMapper::default();
        let outcome =
            Reconciler::new(&mapper).plan(&Document::new(), &[upstream(5, "First"), upstream(5, "Second")]);
        assert_eq!(outcome.plan.to_add.len(), 1);
        assert_eq!(outcome.plan.to_add[0].fields["title"], "First (5)");
    }

    #[test]
    fn unmappable_existing_job_is_neither_updated_nor_removed() {
        let mapper = FieldMapper::default();
        let mut document = seeded(&mapper, &[upstream(1, "A")]);
        let mut blank = DocumentJob::new(" ");
        blank.set_field("title", "legacy");
        document.push(blank).unwrap();

        let blank_record = JobRecord::new(" ", serde_json::Map::new());
        let outcome = Reconciler::new(&mapper).plan(&document, &[upstream(1, "A"), blank_record]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].id, " ");
        assert!(outcome.plan.is_empty());
    }

    #[test]
    fn addition_of_id_already_present_reuses_static_fields() {
        let mapper = FieldMapper::default();
        let plan = Reconciler::new(&mapper).plan(&Document::new(), &[upstream(9, "Analyst")]).plan;

        let mut concurrent = DocumentJob::new("9");
        concurrent.set_field("title", "Old (9)");
        concurrent.set_field(FIELD_REFERENCE_NUMBER, "KEEPME0001");
        let (current, _) = Document::from_jobs([concurrent]);

        let (after, report) = apply(current, &plan, &ReferenceGenerator::new("seed"));
        assert_eq!(report.reused, vec!["9"]);
        assert!(report.added.is_empty());
        let job = after.get("9").unwrap();
        assert_eq!(job.reference_number(), "KEEPME0001");
        assert_eq!(job.field("title"), "Analyst (9)");
    }

    #[test]
    fn generated_references_avoid_taken_tokens() {
        let generator = ReferenceGenerator::new("seed");
        let first = generator.generate("1", &HashSet::new());
        assert_eq!(first, generator.generate("1", &HashSet::new()));

        let taken: HashSet<String> = [first.clone()].into_iter().collect();
        let second = generator.generate("1", &taken);
        assert_ne!(first, second);
        assert_eq!(second.len(), REFERENCE_LEN);
    }

    #[test]
    fn refresh_regenerates_only_selected_jobs() {
        let mapper = FieldMapper::default();
        let mut document = seeded(&mapper, &[upstream(1, "A"), upstream(2, "B")]);
        let untouched = document.get("2").unwrap().reference_number().to_string();

        let changes =
            refresh_reference_numbers(&mut document, &["1".to_string()], &ReferenceGenerator::new("refresh"));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, "1");
        assert_ne!(changes[0].previous, changes[0].current);
        assert_eq!(document.get("1").unwrap().reference_number(), changes[0].current);
        assert_eq!(document.get("2").unwrap().reference_number(), untouched);
    }
}
