use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// Fixed discrepancy taxonomy. Categories never change meaning between runs;
/// downstream materiality thresholds key off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyCategory {
    ValueMismatch,
    TaxAmountMismatch,
    DateMismatch,
    RateMismatch,
    SplitShipment,
    MissingCounterpartyRecord,
}

impl std::fmt::Display for DiscrepancyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValueMismatch => write!(f, "value_mismatch"),
            Self::TaxAmountMismatch => write!(f, "tax_amount_mismatch"),
            Self::DateMismatch => write!(f, "date_mismatch"),
            Self::RateMismatch => write!(f, "rate_mismatch"),
            Self::SplitShipment => write!(f, "split_shipment"),
            Self::MissingCounterpartyRecord => write!(f, "missing_counterparty_record"),
        }
    }
}

/// A classified mismatch derived from one assignment. Zero or more per
/// assignment; `assignment_index` points into the run's assignment vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub assignment_index: usize,
    pub category: DiscrepancyCategory,
    pub field: String,
    pub expected_value: String,
    pub actual_value: String,
    pub magnitude: BigDecimal,
}
