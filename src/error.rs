use bigdecimal::BigDecimal;
use thiserror::Error;

use crate::models::ReconciliationRun;

/// Error taxonomy for reconciliation runs.
///
/// Per-record failures (`Normalization`) are isolated by the caller and
/// reported in the run summary; run-level failures abort the run and carry
/// whatever partial context exists at that point.
#[derive(Error, Debug)]
pub enum ReconError {
    /// A mandatory field was absent or unparsable, a structurally invalid
    /// GSTIN included. The record is excluded from matching and listed in
    /// the run summary. GSTIN checksum failures never produce this error;
    /// they only downgrade record confidence. Oversized buckets likewise
    /// stay non-fatal: they degrade the matching strategy and are counted in
    /// the summary.
    #[error("record {provenance_id}: cannot normalize field '{field}': {reason}")]
    Normalization {
        provenance_id: String,
        field: &'static str,
        reason: String,
    },

    /// Overall job deadline exceeded. Completed bucket results are preserved
    /// on the attached partial run.
    #[error("run for period {period} exceeded its deadline after {completed_buckets} bucket(s)")]
    RunTimeout {
        period: String,
        completed_buckets: usize,
        partial: Box<ReconciliationRun>,
    },

    /// Total input value does not equal total output value after aggregation.
    /// Indicates an engine bug; always fatal, never swallowed.
    #[error("conservation violation on {side} side: input total {expected}, assigned total {actual}")]
    ConservationViolation {
        side: &'static str,
        expected: BigDecimal,
        actual: BigDecimal,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, ReconError>;
