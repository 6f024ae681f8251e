use std::collections::HashMap;

use bigdecimal::{BigDecimal, Zero};

use crate::models::{
    Discrepancy, DiscrepancyCategory, InvoiceRecord, MatchAssignment, MatchType,
};

/// Derives classified discrepancies from assignments. Exact matches produce
/// none; everything else is explained. Emission order is assignment order
/// with fields in a fixed sequence, so reports are reproducible.
pub struct Classifier<'a> {
    records: &'a HashMap<String, InvoiceRecord>,
}

impl<'a> Classifier<'a> {
    /// `records` maps provenance id to the normalized record, both sides.
    pub fn new(records: &'a HashMap<String, InvoiceRecord>) -> Self {
        Self { records }
    }

    pub fn classify_all(&self, assignments: &[MatchAssignment]) -> Vec<Discrepancy> {
        let mut out = Vec::new();
        for (idx, assignment) in assignments.iter().enumerate() {
            self.classify(idx, assignment, &mut out);
        }
        out
    }

    fn classify(&self, idx: usize, assignment: &MatchAssignment, out: &mut Vec<Discrepancy>) {
        match assignment.match_type {
            MatchType::Exact => {}
            MatchType::Fuzzy => self.classify_fuzzy(idx, assignment, out),
            MatchType::Split => self.classify_split(idx, assignment, out),
            MatchType::UnmatchedPurchase | MatchType::UnmatchedSales => {
                self.classify_unmatched(idx, assignment, out)
            }
        }
    }

    /// Field-by-field comparison for a fuzzy pair: taxable value, tax amount,
    /// date, rate, in that order.
    fn classify_fuzzy(&self, idx: usize, assignment: &MatchAssignment, out: &mut Vec<Discrepancy>) {
        let (Some(p), Some(s)) = (
            assignment.purchase_ids.first().and_then(|id| self.records.get(id)),
            assignment.sales_ids.first().and_then(|id| self.records.get(id)),
        ) else {
            return;
        };

        let value_delta = (&s.taxable_value - &p.taxable_value).abs();
        if !value_delta.is_zero() {
            out.push(Discrepancy {
                assignment_index: idx,
                category: DiscrepancyCategory::ValueMismatch,
                field: "taxable_value".to_string(),
                expected_value: p.taxable_value.to_string(),
                actual_value: s.taxable_value.to_string(),
                magnitude: value_delta,
            });
        }

        let tax_delta = (&s.tax_amount - &p.tax_amount).abs();
        if !tax_delta.is_zero() {
            out.push(Discrepancy {
                assignment_index: idx,
                category: DiscrepancyCategory::TaxAmountMismatch,
                field: "tax_amount".to_string(),
                expected_value: p.tax_amount.to_string(),
                actual_value: s.tax_amount.to_string(),
                magnitude: tax_delta,
            });
        }

        let date_offset = (s.invoice_date - p.invoice_date).num_days();
        if date_offset != 0 {
            out.push(Discrepancy {
                assignment_index: idx,
                category: DiscrepancyCategory::DateMismatch,
                field: "invoice_date".to_string(),
                expected_value: p.invoice_date.to_string(),
                actual_value: s.invoice_date.to_string(),
                magnitude: BigDecimal::from(date_offset.abs()),
            });
        }

        if p.tax_rate != s.tax_rate {
            out.push(Discrepancy {
                assignment_index: idx,
                category: DiscrepancyCategory::RateMismatch,
                field: "tax_rate".to_string(),
                expected_value: p.tax_rate.to_string(),
                actual_value: s.tax_rate.to_string(),
                magnitude: (&s.tax_rate - &p.tax_rate).abs(),
            });
        }
    }

    /// One discrepancy per split: magnitude is the residual between the
    /// single side and the sum of the group side, zero when they agree.
    fn classify_split(&self, idx: usize, assignment: &MatchAssignment, out: &mut Vec<Discrepancy>) {
        let purchase_total = self.total(&assignment.purchase_ids);
        let sales_total = self.total(&assignment.sales_ids);
        out.push(Discrepancy {
            assignment_index: idx,
            category: DiscrepancyCategory::SplitShipment,
            field: "taxable_value".to_string(),
            expected_value: purchase_total.to_string(),
            actual_value: sales_total.to_string(),
            magnitude: (&sales_total - &purchase_total).abs(),
        });
    }

    fn classify_unmatched(
        &self,
        idx: usize,
        assignment: &MatchAssignment,
        out: &mut Vec<Discrepancy>,
    ) {
        let id = assignment
            .purchase_ids
            .first()
            .or_else(|| assignment.sales_ids.first());
        let Some(record) = id.and_then(|id| self.records.get(id)) else {
            return;
        };
        let (expected, actual) = match assignment.match_type {
            MatchType::UnmatchedPurchase => (record.taxable_value.to_string(), String::new()),
            _ => (String::new(), record.taxable_value.to_string()),
        };
        out.push(Discrepancy {
            assignment_index: idx,
            category: DiscrepancyCategory::MissingCounterpartyRecord,
            field: "taxable_value".to_string(),
            expected_value: expected,
            actual_value: actual,
            magnitude: record.taxable_value.abs(),
        });
    }

    fn total(&self, ids: &[String]) -> BigDecimal {
        ids.iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.taxable_value.clone())
            .fold(BigDecimal::zero(), |acc, v| acc + v)
    }
}
