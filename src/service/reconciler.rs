use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::config::MatchConfig;
use crate::error::{ReconError, Result};
use crate::gstin::GstinCache;
use crate::index::CandidateIndex;
use crate::models::{
    ExcludedRecord, FilingPeriod, GstinConfidence, InvoiceRecord, MatchAssignment, MatchType,
    RawRecord, ReconciliationRun, RecordSource, RunStatus,
};
use crate::normalize::Normalizer;
use crate::service::classifier::Classifier;
use crate::service::matcher::{BucketOutcome, Matcher};
use crate::service::report::{build_run, ReportInputs};

/// Cooperative cancellation flag, observed between buckets. Cancelling never
/// discards a completed bucket's assignments.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Orchestrates one reconciliation run for one filing period: normalize,
/// bucket, match buckets in parallel, recover low-confidence GSTINs,
/// classify, and finalize. Runs share no mutable state, so runs for
/// different periods or businesses may execute fully in parallel.
pub struct Reconciler {
    cfg: MatchConfig,
}

impl Reconciler {
    pub fn new(cfg: MatchConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &MatchConfig {
        &self.cfg
    }

    /// Pure in-memory run: all inputs are loaded upfront by the caller, so
    /// nothing here blocks on IO.
    pub fn run(
        &self,
        period: FilingPeriod,
        raw_records: Vec<RawRecord>,
        cancel: &CancelToken,
    ) -> Result<ReconciliationRun> {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.cfg.job_deadline_secs);

        // Phase 1: normalize. One bad record never aborts the run.
        let gstin_cache = GstinCache::new();
        let normalizer = Normalizer::new(&self.cfg, &gstin_cache);
        let mut normalized: Vec<InvoiceRecord> = Vec::with_capacity(raw_records.len());
        let mut excluded: Vec<ExcludedRecord> = Vec::new();
        for raw in &raw_records {
            match normalizer.normalize(raw) {
                Ok(record) => normalized.push(record),
                Err(ReconError::Normalization {
                    provenance_id,
                    field,
                    reason,
                }) => {
                    tracing::warn!("excluding record {provenance_id}: {field}: {reason}");
                    excluded.push(ExcludedRecord {
                        provenance_id,
                        source: raw.source,
                        reason: format!("{field}: {reason}"),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        let mut purchase_snapshot = Vec::new();
        let mut sales_snapshot = Vec::new();
        for r in &normalized {
            match r.source {
                RecordSource::Purchase => purchase_snapshot.push(r.provenance_id.clone()),
                RecordSource::Sales => sales_snapshot.push(r.provenance_id.clone()),
            }
        }

        // Phase 2: bucket by (counterparty GSTIN, filing period).
        let index = CandidateIndex::build(normalized);
        let buckets: Vec<_> = index.buckets().cloned().collect();
        tracing::info!(
            "period {period}: {} record(s) in {} bucket(s), {} excluded",
            purchase_snapshot.len() + sales_snapshot.len(),
            buckets.len(),
            excluded.len()
        );

        // Phase 3: match buckets in parallel. Workers observe the cancel
        // token and the deadline before starting a bucket; per-bucket output
        // is merged afterwards, so nothing is lost or duplicated.
        let matcher = Matcher::new(&self.cfg);
        let outcomes: Vec<Option<BucketOutcome>> = buckets
            .par_iter()
            .map(|bucket| {
                if cancel.is_cancelled() || started.elapsed() > deadline {
                    return None;
                }
                Some(matcher.match_bucket(bucket))
            })
            .collect();

        let mut processed: Vec<BucketOutcome> = Vec::new();
        let mut skipped = 0usize;
        let mut processed_records: HashMap<String, InvoiceRecord> = HashMap::new();
        for (bucket, outcome) in buckets.iter().zip(outcomes) {
            match outcome {
                Some(o) => {
                    for r in bucket.purchases.iter().chain(bucket.sales.iter()) {
                        processed_records.insert(r.provenance_id.clone(), r.clone());
                    }
                    processed.push(o);
                }
                None => skipped += 1,
            }
        }

        let oversized_buckets = processed.iter().filter(|o| o.oversized).count();
        let processed_keys: Vec<String> = processed.iter().map(|o| o.key.to_string()).collect();

        // Phase 4: merge, then try to recover unmatched low-confidence
        // records against edit-distance-1 buckets.
        let mut merged: Vec<MatchAssignment> = Vec::new();
        let mut merged_bucket: Vec<String> = Vec::new();
        for outcome in processed {
            let key = outcome.key.to_string();
            for assignment in outcome.assignments {
                merged.push(assignment);
                merged_bucket.push(key.clone());
            }
        }
        let recovered = self.recover_low_confidence(
            &index,
            &processed_records,
            &processed_keys,
            &mut merged,
            &merged_bucket,
            &matcher,
        );
        if recovered > 0 {
            tracing::info!("period {period}: recovered {recovered} low-confidence pair(s)");
        }

        // Phase 5: classify and finalize.
        let discrepancies = Classifier::new(&processed_records).classify_all(&merged);

        let timed_out = !cancel.is_cancelled() && skipped > 0 && started.elapsed() > deadline;
        let status = if cancel.is_cancelled() && skipped > 0 {
            RunStatus::Partial(format!("cancelled with {skipped} bucket(s) unprocessed"))
        } else if timed_out {
            RunStatus::Failed(format!(
                "deadline of {}s exceeded with {skipped} bucket(s) unprocessed",
                self.cfg.job_deadline_secs
            ))
        } else {
            RunStatus::Complete
        };

        let completed_buckets = processed_keys.len();
        let run = build_run(ReportInputs {
            period,
            status,
            records: &processed_records,
            purchase_snapshot,
            sales_snapshot,
            processed_buckets: processed_keys,
            assignments: merged,
            discrepancies,
            excluded,
            oversized_buckets,
        })?;

        if timed_out {
            return Err(ReconError::RunTimeout {
                period: period.to_string(),
                completed_buckets,
                partial: Box::new(run),
            });
        }
        Ok(run)
    }

    /// Second chance for records whose GSTIN failed its checksum: an
    /// unmatched record is offered to the unmatched remainder of buckets one
    /// edit away in the same period. Pairings stay `Fuzzy` at best since the
    /// counterparty identity itself is uncertain. Sequential and ordered, so
    /// the outcome is deterministic.
    fn recover_low_confidence(
        &self,
        index: &CandidateIndex,
        records: &HashMap<String, InvoiceRecord>,
        processed_keys: &[String],
        merged: &mut Vec<MatchAssignment>,
        merged_bucket: &[String],
        matcher: &Matcher<'_>,
    ) -> usize {
        let unmatched_of = |merged: &Vec<MatchAssignment>, i: usize| -> Option<String> {
            let a = &merged[i];
            match a.match_type {
                MatchType::UnmatchedPurchase => a.purchase_ids.first().cloned(),
                MatchType::UnmatchedSales => a.sales_ids.first().cloned(),
                _ => None,
            }
        };

        let mut replaced: Vec<(usize, usize, MatchAssignment)> = Vec::new();
        let mut taken: Vec<bool> = vec![false; merged.len()];

        for i in 0..merged.len() {
            if taken[i] {
                continue;
            }
            let Some(id) = unmatched_of(merged, i) else {
                continue;
            };
            let Some(record) = records.get(&id) else {
                continue;
            };
            if record.gstin_confidence != GstinConfidence::Low {
                continue;
            }

            let candidates = index.recovery_candidates(record, self.cfg.edit_distance_top_k);
            let mut best: Option<(usize, f64)> = None;
            for key in &candidates {
                let key_str = key.to_string();
                if !processed_keys.contains(&key_str) {
                    continue;
                }
                for j in 0..merged.len() {
                    if taken[j] || merged_bucket[j] != key_str {
                        continue;
                    }
                    let Some(other_id) = unmatched_of(merged, j) else {
                        continue;
                    };
                    let Some(other) = records.get(&other_id) else {
                        continue;
                    };
                    if other.source == record.source {
                        continue;
                    }
                    let (p, s) = if record.source == RecordSource::Purchase {
                        (record, other)
                    } else {
                        (other, record)
                    };
                    let offset = (s.invoice_date - p.invoice_date).num_days();
                    if offset.abs() > self.cfg.date_window_days {
                        continue;
                    }
                    let delta = (&s.taxable_value - &p.taxable_value).abs();
                    if !super::matcher::within_value_tolerance(
                        &delta,
                        &p.taxable_value,
                        self.cfg.value_tolerance_pct,
                    ) {
                        continue;
                    }
                    let score = matcher.score_pair(p, s).score;
                    if score < self.cfg.fuzzy_threshold {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((_, best_score)) => score > best_score,
                    };
                    if better {
                        best = Some((j, score));
                    }
                }
            }

            if let Some((j, score)) = best {
                taken[i] = true;
                taken[j] = true;
                let other_id = unmatched_of(merged, j).unwrap_or_default();
                let (purchase_id, sales_id) = if record.source == RecordSource::Purchase {
                    (id, other_id)
                } else {
                    (other_id, id)
                };
                replaced.push((
                    i,
                    j,
                    MatchAssignment {
                        purchase_ids: vec![purchase_id],
                        sales_ids: vec![sales_id],
                        match_type: MatchType::Fuzzy,
                        confidence: score.min(self.cfg.exact_threshold),
                        field_diffs: None,
                    },
                ));
            }
        }

        let recovered = replaced.len();
        if recovered == 0 {
            return 0;
        }
        let mut drop_slots: Vec<bool> = vec![false; merged.len()];
        let mut additions = Vec::with_capacity(recovered);
        for (i, j, assignment) in replaced {
            drop_slots[i] = true;
            drop_slots[j] = true;
            additions.push(assignment);
        }
        let mut kept = Vec::with_capacity(merged.len());
        for (slot, assignment) in merged.drain(..).enumerate() {
            if !drop_slots[slot] {
                kept.push(assignment);
            }
        }
        kept.extend(additions);
        *merged = kept;
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GSTIN: &str = "27AAAPL1234C1ZE";
    // same GSTIN with one corrupted character: fails checksum, edit distance 1
    const GSTIN_OCR: &str = "27AAAPL1234C1Z5";

    fn raw(source: RecordSource, prov: &str, gstin: &str, invoice: &str, date: &str, value: &str) -> RawRecord {
        RawRecord::new(source, prov)
            .with_field("counterparty_gstin", gstin)
            .with_field("invoice_number", invoice)
            .with_field("invoice_date", date)
            .with_field("taxable_value", value)
            .with_field("tax_rate", "18")
    }

    fn period() -> FilingPeriod {
        FilingPeriod { year: 2024, month: 4 }
    }

    #[test]
    fn end_to_end_exact_match() {
        let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
        let run = reconciler
            .run(
                period(),
                vec![
                    raw(RecordSource::Purchase, "p1", GSTIN, "INV001", "05/04/2024", "10000"),
                    raw(RecordSource::Sales, "s1", GSTIN, "INV001", "07/04/2024", "10000"),
                ],
                &CancelToken::new(),
            )
            .unwrap();
        assert!(run.status.is_complete());
        assert_eq!(run.summary.assignments_by_type["exact"], 1);
        assert!(run.summary.excluded_records.is_empty());
    }

    #[test]
    fn bad_record_is_excluded_not_fatal() {
        let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
        let run = reconciler
            .run(
                period(),
                vec![
                    raw(RecordSource::Purchase, "p1", GSTIN, "INV001", "05/04/2024", "10000"),
                    raw(RecordSource::Purchase, "p2", GSTIN, "INV002", "not a date", "5000"),
                    raw(RecordSource::Sales, "s1", GSTIN, "INV001", "05/04/2024", "10000"),
                ],
                &CancelToken::new(),
            )
            .unwrap();
        assert!(run.status.is_complete());
        assert_eq!(run.summary.excluded_records.len(), 1);
        assert_eq!(run.summary.excluded_records[0].provenance_id, "p2");
        assert_eq!(run.summary.assignments_by_type["exact"], 1);
    }

    #[test]
    fn cancellation_yields_explicit_partial() {
        let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = reconciler
            .run(
                period(),
                vec![
                    raw(RecordSource::Purchase, "p1", GSTIN, "INV001", "05/04/2024", "10000"),
                    raw(RecordSource::Sales, "s1", GSTIN, "INV001", "05/04/2024", "10000"),
                ],
                &cancel,
            )
            .unwrap();
        assert!(matches!(run.status, RunStatus::Partial(_)));
        assert!(run.assignments.is_empty());
        assert!(run.processed_buckets.is_empty());
    }

    #[test]
    fn deadline_exceeded_fails_with_partial_context() {
        let cfg = MatchConfig {
            job_deadline_secs: 0,
            ..MatchConfig::default()
        };
        let reconciler = Reconciler::new(cfg).unwrap();
        let err = reconciler
            .run(
                period(),
                vec![
                    raw(RecordSource::Purchase, "p1", GSTIN, "INV001", "05/04/2024", "10000"),
                    raw(RecordSource::Sales, "s1", GSTIN, "INV001", "05/04/2024", "10000"),
                ],
                &CancelToken::new(),
            )
            .unwrap_err();
        match err {
            ReconError::RunTimeout {
                completed_buckets,
                partial,
                ..
            } => {
                assert_eq!(completed_buckets, 0);
                assert!(matches!(partial.status, RunStatus::Failed(_)));
            }
            other => panic!("expected RunTimeout, got {other}"),
        }
    }

    #[test]
    fn low_confidence_gstin_recovers_across_buckets() {
        let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
        let run = reconciler
            .run(
                period(),
                vec![
                    // OCR-corrupted GSTIN lands in its own bucket unmatched,
                    // then recovers against the clean bucket's leftover.
                    raw(RecordSource::Purchase, "p1", GSTIN_OCR, "INV001", "05/04/2024", "10000"),
                    raw(RecordSource::Sales, "s1", GSTIN, "INV001", "06/04/2024", "10000"),
                ],
                &CancelToken::new(),
            )
            .unwrap();
        assert!(run.status.is_complete());
        assert_eq!(run.summary.assignments_by_type.get("fuzzy"), Some(&1));
        assert!(run.summary.assignments_by_type.get("unmatched_purchase").is_none());
        let fuzzy = run
            .assignments
            .iter()
            .find(|a| a.match_type == MatchType::Fuzzy)
            .unwrap();
        assert_eq!(fuzzy.purchase_ids, vec!["p1"]);
        assert_eq!(fuzzy.sales_ids, vec!["s1"]);
    }

    #[test]
    fn determinism_across_identical_runs() {
        let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
        let input = || {
            vec![
                raw(RecordSource::Purchase, "p1", GSTIN, "INV001", "05/04/2024", "10000"),
                raw(RecordSource::Purchase, "p2", GSTIN, "INV002", "06/04/2024", "5000"),
                raw(RecordSource::Sales, "s1", GSTIN, "INV001", "06/04/2024", "10000"),
                raw(RecordSource::Sales, "s2", GSTIN, "INV002-A", "06/04/2024", "3000"),
                raw(RecordSource::Sales, "s3", GSTIN, "INV002-B", "06/04/2024", "2000"),
            ]
        };
        let run_a = reconciler.run(period(), input(), &CancelToken::new()).unwrap();
        let run_b = reconciler.run(period(), input(), &CancelToken::new()).unwrap();
        assert_eq!(run_a.run_id, run_b.run_id);
        assert_eq!(
            serde_json::to_string(&run_a.assignments).unwrap(),
            serde_json::to_string(&run_b.assignments).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&run_a.summary).unwrap(),
            serde_json::to_string(&run_b.summary).unwrap()
        );
    }

    #[test]
    fn conservation_holds_with_splits_and_unmatched() {
        let reconciler = Reconciler::new(MatchConfig::default()).unwrap();
        let run = reconciler
            .run(
                period(),
                vec![
                    raw(RecordSource::Purchase, "p1", GSTIN, "INV001", "05/04/2024", "10000"),
                    raw(RecordSource::Purchase, "p2", GSTIN, "INV003", "05/04/2024", "700"),
                    raw(RecordSource::Sales, "s1", GSTIN, "INV001-A", "05/04/2024", "6000"),
                    raw(RecordSource::Sales, "s2", GSTIN, "INV001-B", "06/04/2024", "4000"),
                ],
                &CancelToken::new(),
            )
            .unwrap();
        use bigdecimal::BigDecimal;
        let purchase_total =
            &run.summary.matched_purchase_value + &run.summary.unmatched_purchase_value;
        let sales_total = &run.summary.matched_sales_value + &run.summary.unmatched_sales_value;
        assert_eq!(purchase_total, BigDecimal::from(10700));
        assert_eq!(sales_total, BigDecimal::from(10000));
        assert_eq!(run.summary.assignments_by_type["split"], 1);
        assert_eq!(run.summary.assignments_by_type["unmatched_purchase"], 1);
    }
}
