use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Discrepancy, ExcludedRecord, FilingPeriod, MatchAssignment};

/// Outcome marker for a finished run. A run is never silently incomplete:
/// anything short of `Complete` names its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RunStatus {
    Complete,
    Partial(String),
    Failed(String),
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial(reason) => write!(f, "partial: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Aggregated totals for a run. Category and type counts use `BTreeMap` so
/// serialized summaries are byte-stable across rebuilds of the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub purchase_records: usize,
    pub sales_records: usize,
    pub matched_purchase_value: BigDecimal,
    pub matched_sales_value: BigDecimal,
    pub unmatched_purchase_value: BigDecimal,
    pub unmatched_sales_value: BigDecimal,
    pub total_discrepancy_value: BigDecimal,
    pub assignments_by_type: BTreeMap<String, usize>,
    pub discrepancies_by_category: BTreeMap<String, usize>,
    pub excluded_records: Vec<ExcludedRecord>,
    pub oversized_buckets: usize,
}

/// Finalized reconciliation run. Owns every assignment and discrepancy it
/// produced. Append-only audit trail: re-running a period produces a new run
/// with a new id, never an edit of a past one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub run_id: String,
    pub period: FilingPeriod,
    pub status: RunStatus,
    /// Provenance ids of the normalized input snapshot, per side.
    pub purchase_snapshot: Vec<String>,
    pub sales_snapshot: Vec<String>,
    /// Bucket keys fully processed by this run; a retry of a `Partial` run
    /// can exclude these.
    pub processed_buckets: Vec<String>,
    pub assignments: Vec<MatchAssignment>,
    pub discrepancies: Vec<Discrepancy>,
    pub summary: RunSummary,
    pub generated_at: DateTime<Utc>,
}
