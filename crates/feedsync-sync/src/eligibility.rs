//! Feed eligibility by open flag and status.
//!
//! The filter never talks to the ATS. An ineligible record yields a
//! [`RemovalAction`] the orchestrator executes and audits.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use feedsync_core::{JobRecord, RemovalAction};
use serde::Deserialize;

/// Statuses that keep a job out of the feed.
pub const DEFAULT_CLOSED_STATUSES: [&str; 10] = [
    "Archive",
    "Canceled",
    "Cancelled",
    "Closed",
    "Filled",
    "Lost",
    "Offer Out",
    "On Hold",
    "Placed",
    "Qualifying",
];

#[derive(Debug, Clone, Deserialize)]
struct EligibilityRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    closed_statuses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    /// `isOpen` is false.
    Closed,
    /// Status on the denylist, as reported upstream.
    Status(String),
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "job is closed (isOpen=false)"),
            Self::Status(status) => write!(f, "status '{status}' is not eligible"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityDecision {
    pub eligible: bool,
    pub reason: Option<IneligibleReason>,
    pub action: Option<RemovalAction>,
}

#[derive(Debug, Clone)]
pub struct FetchedGroup {
    pub grouping_id: String,
    pub records: Vec<JobRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Eligible records, first occurrence per id.
    pub eligible: Vec<JobRecord>,
    pub actions: Vec<RemovalAction>,
    pub fetched: usize,
}

#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    closed_statuses: HashSet<String>,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSED_STATUSES)
    }
}

impl EligibilityFilter {
    pub fn new<I, S>(closed_statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            closed_statuses: closed_statuses
                .into_iter()
                .map(|s| normalize_status(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// `rules/eligibility.yaml`; built-in denylist when the file is absent.
    pub fn from_rules_dir(rules_dir: &Path) -> anyhow::Result<Self> {
        let path = rules_dir.join("eligibility.yaml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let rules: EligibilityRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if rules.closed_statuses.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self::new(rules.closed_statuses))
    }

    pub fn evaluate(&self, record: &JobRecord, grouping_id: &str) -> EligibilityDecision {
        let reason = if record.flag(&["isOpen"]) == Some(false) {
            Some(IneligibleReason::Closed)
        } else {
            record
                .text(&["status"])
                .filter(|status| self.closed_statuses.contains(&normalize_status(status)))
                .map(IneligibleReason::Status)
        };

        match reason {
            None => EligibilityDecision {
                eligible: true,
                reason: None,
                action: None,
            },
            Some(reason) => EligibilityDecision {
                eligible: false,
                action: Some(RemovalAction {
                    job_id: record.id.clone(),
                    grouping_id: grouping_id.to_string(),
                    reason: reason.to_string(),
                    detected_at: Utc::now(),
                }),
                reason: Some(reason),
            },
        }
    }

    /// Split fetched groupings into eligible records and removal actions.
    /// An id listed in several groupings is kept once; each grouping that
    /// lists an ineligible id gets its own removal action.
    pub fn partition(&self, groups: Vec<FetchedGroup>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        let mut seen = HashSet::new();
        for group in groups {
            outcome.fetched += group.records.len();
            for record in group.records {
                let decision = self.evaluate(&record, &group.grouping_id);
                if let Some(action) = decision.action {
                    tracing::info!(
                        job_id = %action.job_id,
                        grouping_id = %action.grouping_id,
                        reason = %action.reason,
                        "job not eligible for feed"
                    );
                    outcome.actions.push(action);
                } else if seen.insert(record.id.clone()) {
                    outcome.eligible.push(record);
                }
            }
        }
        outcome
    }
}

/// Lowercase with internal whitespace collapsed: `"  Offer   OUT "` → `"offer out"`.
pub fn normalize_status(status: &str) -> String {
    status
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> JobRecord {
        JobRecord::from_value(value).unwrap()
    }

    #[test]
    fn filled_job_is_ineligible_with_removal_action() {
        let filter = EligibilityFilter::default();
        let decision = filter.evaluate(&record(json!({"id": 7, "status": "Filled"})), "1256");
        assert!(!decision.eligible);
        assert_eq!(decision.reason, Some(IneligibleReason::Status("Filled".into())));
        let action = decision.action.expect("removal action");
        assert_eq!(action.job_id, "7");
        assert_eq!(action.grouping_id, "1256");
    }

    #[test]
    fn status_match_ignores_case_and_spacing() {
        let filter = EligibilityFilter::default();
        let decision = filter.evaluate(&record(json!({"id": 1, "status": "  offer   OUT "})), "g");
        assert!(!decision.eligible);
    }

    #[test]
    fn closed_flag_wins_over_active_status() {
        let filter = EligibilityFilter::default();
        let decision = filter.evaluate(&record(json!({"id": 1, "status": "Active", "isOpen": "false"})), "g");
        assert_eq!(decision.reason, Some(IneligibleReason::Closed));
    }

    #[test]
    fn active_and_statusless_jobs_are_eligible() {
        let filter = EligibilityFilter::default();
        assert!(filter.evaluate(&record(json!({"id": 1, "status": "Active", "isOpen": true})), "g").eligible);
        assert!(filter.evaluate(&record(json!({"id": 2})), "g").eligible);
    }

    #[test]
    fn partition_dedupes_ids_across_groupings() {
        let filter = EligibilityFilter::default();
        let outcome = filter.partition(vec![
            FetchedGroup {
                grouping_id: "a".into(),
                records: vec![
                    record(json!({"id": 1, "title": "first"})),
                    record(json!({"id": 2, "status": "Filled"})),
                ],
            },
            FetchedGroup {
                grouping_id: "b".into(),
                records: vec![
                    record(json!({"id": 1, "title": "second"})),
                    record(json!({"id": 2, "status": "Filled"})),
                ],
            },
        ]);
        assert_eq!(outcome.fetched, 4);
        assert_eq!(outcome.eligible.len(), 1);
        assert_eq!(outcome.eligible[0].text(&["title"]).as_deref(), Some("first"));
        let groups: Vec<_> = outcome.actions.iter().map(|a| a.grouping_id.as_str()).collect();
        assert_eq!(groups, vec!["a", "b"]);
    }

    #[test]
    fn custom_denylist_replaces_defaults() {
        let filter = EligibilityFilter::new(["Paused"]);
        assert!(!filter.evaluate(&record(json!({"id": 1, "status": "paused"})), "g").eligible);
        assert!(filter.evaluate(&record(json!({"id": 2, "status": "Filled"})), "g").eligible);
    }
}
