//! End-to-end engine tests: raw records in, finalized run out. No database,
//! no server; the engine is pure in-memory.

use bigdecimal::BigDecimal;
use gst_recon_rust::models::{RawRecord, RecordSource};
use gst_recon_rust::service::{CancelToken, Reconciler};
use gst_recon_rust::MatchConfig;

const GSTIN_A: &str = "27AAAPL1234C1ZE";
const GSTIN_B: &str = "29AAAPL1234C1ZA";

fn raw(
    source: RecordSource,
    prov: &str,
    gstin: &str,
    invoice: &str,
    date: &str,
    value: &str,
) -> RawRecord {
    RawRecord::new(source, prov)
        .with_field("counterparty_gstin", gstin)
        .with_field("invoice_number", invoice)
        .with_field("invoice_date", date)
        .with_field("taxable_value", value)
        .with_field("tax_rate", "18")
}

fn period() -> gst_recon_rust::models::FilingPeriod {
    "2024-04".parse().unwrap()
}

fn mixed_input() -> Vec<RawRecord> {
    vec![
        // clean 1:1 pair
        raw(RecordSource::Purchase, "p01", GSTIN_A, "INV001", "05/04/2024", "10000"),
        raw(RecordSource::Sales, "s01", GSTIN_A, "INV001", "07/04/2024", "10000"),
        // rounding skew within tolerance
        raw(RecordSource::Purchase, "p02", GSTIN_A, "INV002", "10/04/2024", "5000"),
        raw(RecordSource::Sales, "s02", GSTIN_A, "INV002", "10/04/2024", "5049"),
        // partial shipment: one purchase, two sales
        raw(RecordSource::Purchase, "p03", GSTIN_B, "INV010", "12/04/2024", "20000"),
        raw(RecordSource::Sales, "s03", GSTIN_B, "INV010-A", "12/04/2024", "12000"),
        raw(RecordSource::Sales, "s04", GSTIN_B, "INV010-B", "13/04/2024", "8000"),
        // no counterparty anywhere
        raw(RecordSource::Purchase, "p04", GSTIN_B, "INV011", "20/04/2024", "750"),
        raw(RecordSource::Sales, "s05", GSTIN_A, "INV099", "22/04/2024", "1234"),
        // unparsable amount, gets excluded
        raw(RecordSource::Purchase, "p05", GSTIN_A, "INV012", "21/04/2024", "garbage"),
    ]
}

#[test]
fn full_run_classifies_all_shapes() {
    let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
    let run = reconciler
        .run(period(), mixed_input(), &CancelToken::new())
        .unwrap();

    assert!(run.status.is_complete());
    assert_eq!(run.summary.assignments_by_type["exact"], 1);
    assert_eq!(run.summary.assignments_by_type["fuzzy"], 1);
    assert_eq!(run.summary.assignments_by_type["split"], 1);
    assert_eq!(run.summary.assignments_by_type["unmatched_purchase"], 1);
    assert_eq!(run.summary.assignments_by_type["unmatched_sales"], 1);
    assert_eq!(run.summary.excluded_records.len(), 1);
    assert_eq!(run.summary.excluded_records[0].provenance_id, "p05");

    assert_eq!(
        run.summary.discrepancies_by_category["missing_counterparty_record"],
        2
    );
    assert_eq!(run.summary.discrepancies_by_category["split_shipment"], 1);
}

#[test]
fn conservation_on_both_sides() {
    let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
    let run = reconciler
        .run(period(), mixed_input(), &CancelToken::new())
        .unwrap();

    // Purchase inputs that survived normalization:
    // 10000 + 5000 + 20000 + 750 (p05 excluded)
    let purchase_total =
        &run.summary.matched_purchase_value + &run.summary.unmatched_purchase_value;
    assert_eq!(purchase_total, BigDecimal::from(35750));

    // Sales inputs: 10000 + 5049 + 12000 + 8000 + 1234
    let sales_total = &run.summary.matched_sales_value + &run.summary.unmatched_sales_value;
    assert_eq!(sales_total, BigDecimal::from(36283));
}

#[test]
fn every_record_appears_in_exactly_one_assignment() {
    let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
    let run = reconciler
        .run(period(), mixed_input(), &CancelToken::new())
        .unwrap();

    let mut purchase_ids: Vec<&str> = Vec::new();
    let mut sales_ids: Vec<&str> = Vec::new();
    for a in &run.assignments {
        purchase_ids.extend(a.purchase_ids.iter().map(String::as_str));
        sales_ids.extend(a.sales_ids.iter().map(String::as_str));
    }
    purchase_ids.sort_unstable();
    sales_ids.sort_unstable();
    assert_eq!(purchase_ids, vec!["p01", "p02", "p03", "p04"]);
    assert_eq!(sales_ids, vec!["s01", "s02", "s03", "s04", "s05"]);
}

#[test]
fn identical_inputs_identical_runs() {
    let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
    let run_a = reconciler
        .run(period(), mixed_input(), &CancelToken::new())
        .unwrap();
    let run_b = reconciler
        .run(period(), mixed_input(), &CancelToken::new())
        .unwrap();

    assert_eq!(run_a.run_id, run_b.run_id);
    assert_eq!(
        serde_json::to_string(&run_a.assignments).unwrap(),
        serde_json::to_string(&run_b.assignments).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&run_a.discrepancies).unwrap(),
        serde_json::to_string(&run_b.discrepancies).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&run_a.summary).unwrap(),
        serde_json::to_string(&run_b.summary).unwrap()
    );
}

#[test]
fn tighter_tolerance_demotes_fuzzy_pair() {
    // With the value tolerance pulled to zero the INV002 rounding skew no
    // longer pairs, and both records surface as unmatched.
    let cfg = MatchConfig {
        value_tolerance_pct: 0.0,
        ..MatchConfig::default()
    };
    let reconciler = Reconciler::new(cfg).unwrap();
    let run = reconciler
        .run(
            period(),
            vec![
                raw(RecordSource::Purchase, "p02", GSTIN_A, "INV002", "10/04/2024", "5000"),
                raw(RecordSource::Sales, "s02", GSTIN_A, "INV002", "10/04/2024", "5049"),
            ],
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(run.summary.assignments_by_type["unmatched_purchase"], 1);
    assert_eq!(run.summary.assignments_by_type["unmatched_sales"], 1);
}

#[test]
fn run_ids_differ_between_snapshots() {
    let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
    let run_a = reconciler
        .run(period(), mixed_input(), &CancelToken::new())
        .unwrap();
    let mut smaller = mixed_input();
    // drop s05, a record that survives normalization and so changes the
    // input snapshot
    smaller.remove(8);
    let run_b = reconciler
        .run(period(), smaller, &CancelToken::new())
        .unwrap();
    assert_ne!(run_a.run_id, run_b.run_id);
}
