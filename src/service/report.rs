use std::collections::{BTreeMap, HashMap, HashSet};

use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{ReconError, Result};
use crate::models::{
    Discrepancy, DiscrepancyCategory, ExcludedRecord, FilingPeriod, InvoiceRecord,
    MatchAssignment, MatchType, ReconciliationRun, RecordSource, RunStatus, RunSummary,
};

/// Inputs for finalizing one run. `records` must contain exactly the
/// normalized records of the processed buckets; the builder checks that the
/// assignments conserve their value.
pub struct ReportInputs<'a> {
    pub period: FilingPeriod,
    pub status: RunStatus,
    pub records: &'a HashMap<String, InvoiceRecord>,
    pub purchase_snapshot: Vec<String>,
    pub sales_snapshot: Vec<String>,
    pub processed_buckets: Vec<String>,
    pub assignments: Vec<MatchAssignment>,
    pub discrepancies: Vec<Discrepancy>,
    pub excluded: Vec<ExcludedRecord>,
    pub oversized_buckets: usize,
}

/// Finalize a run. Idempotent: the same immutable input snapshot always
/// yields the same run id and byte-identical summary totals.
pub fn build_run(mut inputs: ReportInputs<'_>) -> Result<ReconciliationRun> {
    inputs.purchase_snapshot.sort();
    inputs.sales_snapshot.sort();
    inputs.processed_buckets.sort();

    verify_assignment_coverage(&inputs)?;
    let summary = summarize(&inputs)?;
    let run_id = run_id(&inputs);

    tracing::info!(
        "run {}: {} assignment(s), {} discrepancy(ies), status {}",
        run_id,
        inputs.assignments.len(),
        inputs.discrepancies.len(),
        inputs.status
    );

    Ok(ReconciliationRun {
        run_id,
        period: inputs.period,
        status: inputs.status,
        purchase_snapshot: inputs.purchase_snapshot,
        sales_snapshot: inputs.sales_snapshot,
        processed_buckets: inputs.processed_buckets,
        assignments: inputs.assignments,
        discrepancies: inputs.discrepancies,
        summary,
        generated_at: Utc::now(),
    })
}

/// Period plus a digest of the sorted input snapshot: re-running the same
/// snapshot is observably the same run, a new snapshot is a new run.
fn run_id(inputs: &ReportInputs<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(inputs.period.to_string().as_bytes());
    for id in inputs
        .purchase_snapshot
        .iter()
        .chain(inputs.sales_snapshot.iter())
    {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}", inputs.period, hex)
}

/// Every record of the processed buckets appears in exactly one assignment:
/// no duplicates, no omissions, even for zero-value records the value totals
/// would not notice.
fn verify_assignment_coverage(inputs: &ReportInputs<'_>) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicated = false;
    let mut purchase_refs = 0usize;
    let mut sales_refs = 0usize;
    for assignment in &inputs.assignments {
        for id in &assignment.purchase_ids {
            purchase_refs += 1;
            duplicated |= !seen.insert(id.as_str());
        }
        for id in &assignment.sales_ids {
            sales_refs += 1;
            duplicated |= !seen.insert(id.as_str());
        }
    }
    for (side, source, refs) in [
        ("purchase", RecordSource::Purchase, purchase_refs),
        ("sales", RecordSource::Sales, sales_refs),
    ] {
        let record_count = inputs
            .records
            .values()
            .filter(|r| r.source == source)
            .count();
        if duplicated || refs != record_count {
            return Err(ReconError::ConservationViolation {
                side,
                expected: BigDecimal::from(record_count as i64),
                actual: BigDecimal::from(refs as i64),
            });
        }
    }
    Ok(())
}

fn summarize(inputs: &ReportInputs<'_>) -> Result<RunSummary> {
    let mut matched_purchase_value = BigDecimal::zero();
    let mut matched_sales_value = BigDecimal::zero();
    let mut unmatched_purchase_value = BigDecimal::zero();
    let mut unmatched_sales_value = BigDecimal::zero();
    let mut assignments_by_type: BTreeMap<String, usize> = BTreeMap::new();

    let value_of = |id: &String| {
        inputs
            .records
            .get(id)
            .map(|r| r.taxable_value.clone())
            .unwrap_or_else(BigDecimal::zero)
    };

    for assignment in &inputs.assignments {
        *assignments_by_type
            .entry(assignment.match_type.to_string())
            .or_insert(0) += 1;
        let purchase_total: BigDecimal = assignment
            .purchase_ids
            .iter()
            .map(value_of)
            .fold(BigDecimal::zero(), |acc, v| acc + v);
        let sales_total: BigDecimal = assignment
            .sales_ids
            .iter()
            .map(value_of)
            .fold(BigDecimal::zero(), |acc, v| acc + v);
        match assignment.match_type {
            MatchType::Exact | MatchType::Fuzzy | MatchType::Split => {
                matched_purchase_value += purchase_total;
                matched_sales_value += sales_total;
            }
            MatchType::UnmatchedPurchase => unmatched_purchase_value += purchase_total,
            MatchType::UnmatchedSales => unmatched_sales_value += sales_total,
        }
    }

    // Conservation: matching may move records between categories but never
    // creates or destroys value. A violation is an engine bug and aborts.
    for (side, source, assigned) in [
        (
            "purchase",
            RecordSource::Purchase,
            &matched_purchase_value + &unmatched_purchase_value,
        ),
        (
            "sales",
            RecordSource::Sales,
            &matched_sales_value + &unmatched_sales_value,
        ),
    ] {
        let input_total: BigDecimal = inputs
            .records
            .values()
            .filter(|r| r.source == source)
            .map(|r| r.taxable_value.clone())
            .fold(BigDecimal::zero(), |acc, v| acc + v);
        if input_total != assigned {
            return Err(ReconError::ConservationViolation {
                side,
                expected: input_total,
                actual: assigned,
            });
        }
    }

    let mut discrepancies_by_category: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_discrepancy_value = BigDecimal::zero();
    for d in &inputs.discrepancies {
        *discrepancies_by_category
            .entry(d.category.to_string())
            .or_insert(0) += 1;
        // Date and rate magnitudes are not rupee amounts; keep the monetary
        // total monetary.
        if !matches!(
            d.category,
            DiscrepancyCategory::DateMismatch | DiscrepancyCategory::RateMismatch
        ) {
            total_discrepancy_value += &d.magnitude;
        }
    }

    let purchase_records = inputs
        .records
        .values()
        .filter(|r| r.source == RecordSource::Purchase)
        .count();
    let sales_records = inputs.records.len() - purchase_records;

    Ok(RunSummary {
        purchase_records,
        sales_records,
        matched_purchase_value,
        matched_sales_value,
        unmatched_purchase_value,
        unmatched_sales_value,
        total_discrepancy_value,
        assignments_by_type,
        discrepancies_by_category,
        excluded_records: inputs.excluded.clone(),
        oversized_buckets: inputs.oversized_buckets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GstinConfidence, MatchType};
    use chrono::NaiveDate;

    fn record(prov: &str, source: RecordSource, value: i64) -> InvoiceRecord {
        InvoiceRecord {
            source,
            counterparty_gstin: "27AAAPL1234C1ZE".to_string(),
            gstin_confidence: GstinConfidence::Normal,
            invoice_number: "INV001".to_string(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 4, 5).unwrap(),
            taxable_value: BigDecimal::from(value),
            tax_rate: BigDecimal::from(18),
            tax_amount: BigDecimal::from(value * 18 / 100),
            filing_period: FilingPeriod { year: 2024, month: 4 },
            provenance_id: prov.to_string(),
        }
    }

    fn record_map(records: Vec<InvoiceRecord>) -> HashMap<String, InvoiceRecord> {
        records
            .into_iter()
            .map(|r| (r.provenance_id.clone(), r))
            .collect()
    }

    fn inputs<'a>(
        records: &'a HashMap<String, InvoiceRecord>,
        assignments: Vec<MatchAssignment>,
    ) -> ReportInputs<'a> {
        let mut purchase_snapshot = Vec::new();
        let mut sales_snapshot = Vec::new();
        for r in records.values() {
            match r.source {
                RecordSource::Purchase => purchase_snapshot.push(r.provenance_id.clone()),
                RecordSource::Sales => sales_snapshot.push(r.provenance_id.clone()),
            }
        }
        ReportInputs {
            period: FilingPeriod { year: 2024, month: 4 },
            status: RunStatus::Complete,
            records,
            purchase_snapshot,
            sales_snapshot,
            processed_buckets: vec!["27AAAPL1234C1ZE:2024-04".to_string()],
            assignments,
            discrepancies: Vec::new(),
            excluded: Vec::new(),
            oversized_buckets: 0,
        }
    }

    fn pair(p: &str, s: &str, match_type: MatchType) -> MatchAssignment {
        MatchAssignment {
            purchase_ids: vec![p.to_string()],
            sales_ids: vec![s.to_string()],
            match_type,
            confidence: 1.0,
            field_diffs: None,
        }
    }

    #[test]
    fn summary_totals_split_by_category() {
        let map = record_map(vec![
            record("p1", RecordSource::Purchase, 10000),
            record("p2", RecordSource::Purchase, 500),
            record("s1", RecordSource::Sales, 10000),
        ]);
        let assignments = vec![
            pair("p1", "s1", MatchType::Exact),
            MatchAssignment::unmatched_purchase("p2".into()),
        ];
        let run = build_run(inputs(&map, assignments)).unwrap();
        assert_eq!(run.summary.matched_purchase_value, BigDecimal::from(10000));
        assert_eq!(run.summary.unmatched_purchase_value, BigDecimal::from(500));
        assert_eq!(run.summary.matched_sales_value, BigDecimal::from(10000));
        assert_eq!(run.summary.assignments_by_type["exact"], 1);
        assert_eq!(run.summary.assignments_by_type["unmatched_purchase"], 1);
    }

    #[test]
    fn conservation_violation_is_fatal() {
        let map = record_map(vec![
            record("p1", RecordSource::Purchase, 10000),
            record("s1", RecordSource::Sales, 10000),
        ]);
        // p1 never assigned: value vanished
        let assignments = vec![MatchAssignment::unmatched_sales("s1".into())];
        let err = build_run(inputs(&map, assignments)).unwrap_err();
        assert!(matches!(
            err,
            ReconError::ConservationViolation { side: "purchase", .. }
        ));
    }

    #[test]
    fn duplicate_assignment_is_fatal() {
        let map = record_map(vec![
            record("p1", RecordSource::Purchase, 10000),
            record("s1", RecordSource::Sales, 10000),
            record("s2", RecordSource::Sales, 10000),
        ]);
        let assignments = vec![
            pair("p1", "s1", MatchType::Exact),
            pair("p1", "s2", MatchType::Fuzzy),
        ];
        assert!(build_run(inputs(&map, assignments)).is_err());
    }

    #[test]
    fn finalization_is_idempotent() {
        let map = record_map(vec![
            record("p1", RecordSource::Purchase, 10000),
            record("s1", RecordSource::Sales, 10000),
        ]);
        let assignments = vec![pair("p1", "s1", MatchType::Exact)];
        let run_a = build_run(inputs(&map, assignments.clone())).unwrap();
        let run_b = build_run(inputs(&map, assignments)).unwrap();
        assert_eq!(run_a.run_id, run_b.run_id);
        assert_eq!(run_a.summary, run_b.summary);
        assert_eq!(
            serde_json::to_string(&run_a.summary).unwrap(),
            serde_json::to_string(&run_b.summary).unwrap()
        );
    }

    #[test]
    fn run_id_tracks_snapshot() {
        let map_a = record_map(vec![
            record("p1", RecordSource::Purchase, 10000),
            record("s1", RecordSource::Sales, 10000),
        ]);
        let map_b = record_map(vec![
            record("p9", RecordSource::Purchase, 10000),
            record("s1", RecordSource::Sales, 10000),
        ]);
        let run_a = build_run(inputs(&map_a, vec![pair("p1", "s1", MatchType::Exact)])).unwrap();
        let run_b = build_run(inputs(&map_b, vec![pair("p9", "s1", MatchType::Exact)])).unwrap();
        assert_ne!(run_a.run_id, run_b.run_id);
        assert!(run_a.run_id.starts_with("2024-04-"));
    }
}
