use std::fmt;
use std::path::PathBuf;

use feedsync_core::{Document, ReconciliationPlan};
use serde::Serialize;

pub const DEFAULT_MIN_EXISTING_JOBS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    /// No eligible jobs came back while the feed is populated.
    EmptyUpstream,
    /// The plan would empty a populated feed without adding anything.
    TotalRemoval,
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyUpstream => write!(f, "upstream returned no eligible jobs"),
            Self::TotalRemoval => write!(f, "plan would remove every job"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardAlert {
    pub reason: GuardReason,
    pub existing_jobs: usize,
    pub eligible_jobs: usize,
    pub planned_removals: usize,
    /// Set once the current feed has been copied aside.
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    Proceed,
    Blocked(GuardAlert),
}

impl GuardDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Refuses cycles that would wipe a populated feed because upstream came
/// back empty.
#[derive(Debug, Clone, Copy)]
pub struct CorruptionGuard {
    min_existing_jobs: usize,
}

impl Default for CorruptionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_EXISTING_JOBS)
    }
}

impl CorruptionGuard {
    pub fn new(min_existing_jobs: usize) -> Self {
        Self { min_existing_jobs }
    }

    pub fn min_existing_jobs(&self) -> usize {
        self.min_existing_jobs
    }

    /// An empty feed has nothing to protect, whatever the threshold.
    fn protects(&self, document: &Document) -> bool {
        !document.is_empty() && document.len() >= self.min_existing_jobs
    }

    pub fn check(&self, document: &Document, eligible_jobs: usize) -> GuardDecision {
        if eligible_jobs == 0 && self.protects(document) {
            return GuardDecision::Blocked(GuardAlert {
                reason: GuardReason::EmptyUpstream,
                existing_jobs: document.len(),
                eligible_jobs,
                planned_removals: document.len(),
                backup_path: None,
            });
        }
        GuardDecision::Proceed
    }

    pub fn check_plan(
        &self,
        document: &Document,
        plan: &ReconciliationPlan,
        eligible_jobs: usize,
    ) -> GuardDecision {
        let wipes_everything = plan.to_add.is_empty() && plan.to_remove.len() >= document.len();
        if self.protects(document) && wipes_everything {
            return GuardDecision::Blocked(GuardAlert {
                reason: GuardReason::TotalRemoval,
                existing_jobs: document.len(),
                eligible_jobs,
                planned_removals: plan.to_remove.len(),
                backup_path: None,
            });
        }
        GuardDecision::Proceed
    }
}
