use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// Per-field differences between a candidate purchase/sales pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDiffs {
    pub value_delta: BigDecimal,
    pub tax_delta: BigDecimal,
    pub date_offset_days: i64,
    pub invoice_number_exact: bool,
    pub rate_equal: bool,
}

/// Scored candidate pairing. Transient: produced and consumed inside a single
/// matching run, never persisted.
#[derive(Debug, Clone)]
pub struct MatchCandidatePair {
    pub purchase_id: String,
    pub sales_id: String,
    pub purchase_invoice_number: String,
    pub score: f64,
    pub field_diffs: FieldDiffs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Split,
    UnmatchedPurchase,
    UnmatchedSales,
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Fuzzy => write!(f, "fuzzy"),
            Self::Split => write!(f, "split"),
            Self::UnmatchedPurchase => write!(f, "unmatched_purchase"),
            Self::UnmatchedSales => write!(f, "unmatched_sales"),
        }
    }
}

/// One assignment per involved record: every input record appears in exactly
/// one assignment, so no record is silently dropped.
///
/// `Exact`/`Fuzzy` carry one provenance id per side. `Split` carries one id on
/// one side and two or more on the other. `Unmatched*` carry one id on one
/// side and none on the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchAssignment {
    pub purchase_ids: Vec<String>,
    pub sales_ids: Vec<String>,
    pub match_type: MatchType,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_diffs: Option<FieldDiffs>,
}

impl MatchAssignment {
    pub fn pair(
        purchase_id: String,
        sales_id: String,
        match_type: MatchType,
        confidence: f64,
        field_diffs: FieldDiffs,
    ) -> Self {
        Self {
            purchase_ids: vec![purchase_id],
            sales_ids: vec![sales_id],
            match_type,
            confidence,
            field_diffs: Some(field_diffs),
        }
    }

    pub fn unmatched_purchase(purchase_id: String) -> Self {
        Self {
            purchase_ids: vec![purchase_id],
            sales_ids: Vec::new(),
            match_type: MatchType::UnmatchedPurchase,
            confidence: 0.0,
            field_diffs: None,
        }
    }

    pub fn unmatched_sales(sales_id: String) -> Self {
        Self {
            purchase_ids: Vec::new(),
            sales_ids: vec![sales_id],
            match_type: MatchType::UnmatchedSales,
            confidence: 0.0,
            field_diffs: None,
        }
    }
}
