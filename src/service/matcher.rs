use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexSet;
use strsim::jaro_winkler;

use crate::config::MatchConfig;
use crate::index::{Bucket, BucketKey};
use crate::models::{
    FieldDiffs, InvoiceRecord, MatchAssignment, MatchCandidatePair, MatchType,
};
use crate::normalize::decimal_from_f64;

/// Result of matching one bucket. Every record of the bucket appears in
/// exactly one assignment.
#[derive(Debug)]
pub struct BucketOutcome {
    pub key: BucketKey,
    pub assignments: Vec<MatchAssignment>,
    pub candidate_count: usize,
    pub oversized: bool,
}

/// Scored candidate plus the indices it was built from.
struct ScoredCandidate {
    purchase_idx: usize,
    sales_idx: usize,
    pair: MatchCandidatePair,
}

/// Greedy deterministic matcher. Highest-scoring pair first, ties broken by
/// lexicographically smaller invoice number then earlier provenance id, so
/// identical inputs always yield identical assignments. A deliberate
/// approximation of maximum-weight bipartite matching traded for
/// reproducibility and near-linear behavior per bucket.
pub struct Matcher<'a> {
    cfg: &'a MatchConfig,
}

impl<'a> Matcher<'a> {
    pub fn new(cfg: &'a MatchConfig) -> Self {
        Self { cfg }
    }

    pub fn match_bucket(&self, bucket: &Bucket) -> BucketOutcome {
        let oversized = bucket.len() > self.cfg.max_bucket_size;
        if oversized {
            tracing::warn!(
                "bucket {} has {} records, degrading to exact invoice-number pruning",
                bucket.key,
                bucket.len()
            );
        }

        let candidates = self.build_candidates(bucket, oversized);
        let candidate_count = candidates.len();

        let mut assignments = Vec::new();
        let mut consumed_purchases: IndexSet<usize> = IndexSet::new();
        let mut consumed_sales: IndexSet<usize> = IndexSet::new();

        // Greedy pass: best pair first, both records leave the pool.
        for cand in &candidates {
            if cand.pair.score < self.cfg.fuzzy_threshold {
                break;
            }
            if consumed_purchases.contains(&cand.purchase_idx)
                || consumed_sales.contains(&cand.sales_idx)
            {
                continue;
            }
            consumed_purchases.insert(cand.purchase_idx);
            consumed_sales.insert(cand.sales_idx);

            let match_type = if cand.pair.score >= self.cfg.exact_threshold {
                MatchType::Exact
            } else {
                MatchType::Fuzzy
            };
            assignments.push(MatchAssignment::pair(
                cand.pair.purchase_id.clone(),
                cand.pair.sales_id.clone(),
                match_type,
                cand.pair.score,
                cand.pair.field_diffs.clone(),
            ));
        }

        // Split pass: one purchase against a group of sales summing within
        // tolerance (partial shipments, credit notes), then the mirror image.
        self.split_pass(
            &bucket.purchases,
            &bucket.sales,
            &mut consumed_purchases,
            &mut consumed_sales,
            true,
            &mut assignments,
        );
        self.split_pass(
            &bucket.sales,
            &bucket.purchases,
            &mut consumed_sales,
            &mut consumed_purchases,
            false,
            &mut assignments,
        );

        // Whatever is left is genuinely unmatched.
        for (pi, p) in bucket.purchases.iter().enumerate() {
            if !consumed_purchases.contains(&pi) {
                assignments.push(MatchAssignment::unmatched_purchase(p.provenance_id.clone()));
            }
        }
        for (si, s) in bucket.sales.iter().enumerate() {
            if !consumed_sales.contains(&si) {
                assignments.push(MatchAssignment::unmatched_sales(s.provenance_id.clone()));
            }
        }

        BucketOutcome {
            key: bucket.key.clone(),
            assignments,
            candidate_count,
            oversized,
        }
    }

    /// Score one purchase/sales pair that already passed the window and
    /// tolerance gates.
    pub fn score_pair(&self, p: &InvoiceRecord, s: &InvoiceRecord) -> MatchCandidatePair {
        let date_offset = (s.invoice_date - p.invoice_date).num_days();
        let value_delta = &s.taxable_value - &p.taxable_value;
        let tax_delta = &s.tax_amount - &p.tax_amount;
        let invoice_number_exact = p.invoice_number == s.invoice_number;
        let rate_equal = p.tax_rate == s.tax_rate;

        let invoice_sim = if invoice_number_exact {
            1.0
        } else {
            jaro_winkler(&p.invoice_number, &s.invoice_number)
        };
        let date_closeness = if self.cfg.date_window_days == 0 {
            1.0
        } else {
            1.0 - date_offset.unsigned_abs() as f64 / self.cfg.date_window_days as f64
        };
        let value_closeness = value_closeness(
            &value_delta.abs(),
            &p.taxable_value,
            self.cfg.value_tolerance_pct,
        );

        let rate_score = if rate_equal { 1.0 } else { 0.0 };
        let score = self.cfg.weight_invoice_number * invoice_sim
            + self.cfg.weight_date * date_closeness
            + self.cfg.weight_value * value_closeness
            + self.cfg.weight_rate * rate_score;

        MatchCandidatePair {
            purchase_id: p.provenance_id.clone(),
            sales_id: s.provenance_id.clone(),
            purchase_invoice_number: p.invoice_number.clone(),
            score,
            field_diffs: FieldDiffs {
                value_delta,
                tax_delta,
                date_offset_days: date_offset,
                invoice_number_exact,
                rate_equal,
            },
        }
    }

    fn build_candidates(&self, bucket: &Bucket, oversized: bool) -> Vec<ScoredCandidate> {
        let mut candidates = Vec::new();
        for (pi, p) in bucket.purchases.iter().enumerate() {
            for (si, s) in bucket.sales.iter().enumerate() {
                if oversized && p.invoice_number != s.invoice_number {
                    continue;
                }
                let date_offset = (s.invoice_date - p.invoice_date).num_days();
                if date_offset.abs() > self.cfg.date_window_days {
                    continue;
                }
                let delta = (&s.taxable_value - &p.taxable_value).abs();
                if !within_value_tolerance(&delta, &p.taxable_value, self.cfg.value_tolerance_pct) {
                    continue;
                }
                candidates.push(ScoredCandidate {
                    purchase_idx: pi,
                    sales_idx: si,
                    pair: self.score_pair(p, s),
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.pair
                .score
                .total_cmp(&a.pair.score)
                .then_with(|| {
                    a.pair
                        .purchase_invoice_number
                        .cmp(&b.pair.purchase_invoice_number)
                })
                .then_with(|| a.pair.purchase_id.cmp(&b.pair.purchase_id))
                .then_with(|| a.pair.sales_id.cmp(&b.pair.sales_id))
        });
        candidates
    }

    /// For each unconsumed record on the `singles` side (value-descending,
    /// provenance-ascending), search unconsumed `group_side` records for a
    /// subset summing within tolerance of its value.
    fn split_pass(
        &self,
        singles: &[InvoiceRecord],
        group_side: &[InvoiceRecord],
        consumed_singles: &mut IndexSet<usize>,
        consumed_group: &mut IndexSet<usize>,
        singles_are_purchases: bool,
        assignments: &mut Vec<MatchAssignment>,
    ) {
        let mut single_order: Vec<usize> = (0..singles.len())
            .filter(|i| !consumed_singles.contains(i))
            .collect();
        single_order.sort_by(|&a, &b| {
            singles[b]
                .taxable_value
                .abs()
                .cmp(&singles[a].taxable_value.abs())
                .then_with(|| singles[a].provenance_id.cmp(&singles[b].provenance_id))
        });

        for si in single_order {
            let target = &singles[si].taxable_value;
            let tolerance = tolerance_abs(target, self.cfg.value_tolerance_pct);

            // Candidates sorted by absolute value descending so the search
            // prunes early; provenance breaks ties.
            let mut available: Vec<usize> = (0..group_side.len())
                .filter(|i| !consumed_group.contains(i))
                .collect();
            available.sort_by(|&a, &b| {
                group_side[b]
                    .taxable_value
                    .abs()
                    .cmp(&group_side[a].taxable_value.abs())
                    .then_with(|| group_side[a].provenance_id.cmp(&group_side[b].provenance_id))
            });
            if available.len() < 2 {
                continue;
            }

            let values: Vec<&BigDecimal> = available
                .iter()
                .map(|&i| &group_side[i].taxable_value)
                .collect();
            let search = subset_sum(
                &values,
                target,
                &tolerance,
                self.cfg.max_split_group,
                self.cfg.split_max_nodes,
            );

            let Some((chosen, delta)) = search.best else {
                continue;
            };

            consumed_singles.insert(si);
            let mut group_ids: Vec<String> = Vec::with_capacity(chosen.len());
            for &ci in &chosen {
                consumed_group.insert(available[ci]);
                group_ids.push(group_side[available[ci]].provenance_id.clone());
            }
            group_ids.sort();

            let confidence = value_closeness(&delta, target, self.cfg.value_tolerance_pct);
            let single_id = singles[si].provenance_id.clone();
            let (purchase_ids, sales_ids) = if singles_are_purchases {
                (vec![single_id], group_ids)
            } else {
                (group_ids, vec![single_id])
            };
            assignments.push(MatchAssignment {
                purchase_ids,
                sales_ids,
                match_type: MatchType::Split,
                confidence,
                field_diffs: None,
            });
        }
    }
}

/// `|delta| <= pct/100 * |base|`, computed in exact decimals.
pub fn within_value_tolerance(delta: &BigDecimal, base: &BigDecimal, pct: f64) -> bool {
    delta * BigDecimal::from(100) <= base.abs() * decimal_from_f64(pct)
}

fn tolerance_abs(base: &BigDecimal, pct: f64) -> BigDecimal {
    base.abs() * decimal_from_f64(pct) / BigDecimal::from(100)
}

/// 1.0 at zero delta, falling linearly to 0.0 at the tolerance edge.
fn value_closeness(delta: &BigDecimal, base: &BigDecimal, pct: f64) -> f64 {
    use bigdecimal::ToPrimitive;
    if delta.is_zero() {
        return 1.0;
    }
    let tol = tolerance_abs(base, pct);
    if tol.is_zero() {
        return 0.0;
    }
    let ratio = (delta / &tol).to_f64().unwrap_or(1.0);
    (1.0 - ratio).clamp(0.0, 1.0)
}

struct SubsetSearch {
    /// Chosen indices into the candidate slice plus the absolute delta.
    best: Option<(Vec<usize>, BigDecimal)>,
    nodes: u64,
    cap_hit: bool,
}

/// Bounded depth-first subset-sum: smallest absolute delta within tolerance
/// wins, first-found wins ties, group size and node budget capped. Negative
/// amounts (credit notes) are allowed; the early prune only applies to
/// positive continuations.
fn subset_sum(
    values: &[&BigDecimal],
    target: &BigDecimal,
    tolerance: &BigDecimal,
    max_group: usize,
    max_nodes: u64,
) -> SubsetSearch {
    let mut search = SubsetSearch {
        best: None,
        nodes: 0,
        cap_hit: false,
    };
    let mut chosen = Vec::new();
    dfs(
        values,
        target,
        tolerance,
        max_group,
        max_nodes,
        0,
        &BigDecimal::zero(),
        &mut chosen,
        &mut search,
    );
    search
}

#[allow(clippy::too_many_arguments)]
fn dfs(
    values: &[&BigDecimal],
    target: &BigDecimal,
    tolerance: &BigDecimal,
    max_group: usize,
    max_nodes: u64,
    start: usize,
    sum: &BigDecimal,
    chosen: &mut Vec<usize>,
    search: &mut SubsetSearch,
) {
    if search.cap_hit {
        return;
    }
    if let Some((_, best_delta)) = &search.best {
        // An exact hit cannot be improved on.
        if best_delta.is_zero() {
            return;
        }
    }
    if chosen.len() >= 2 {
        let delta = (sum - target).abs();
        if &delta <= tolerance {
            let better = match &search.best {
                None => true,
                Some((_, best_delta)) => &delta < best_delta,
            };
            if better {
                search.best = Some((chosen.clone(), delta));
            }
        }
    }
    if chosen.len() == max_group {
        return;
    }
    for i in start..values.len() {
        search.nodes += 1;
        if search.nodes > max_nodes {
            search.cap_hit = true;
            return;
        }
        let next = sum + values[i];
        // Values are sorted by |value| descending; once a positive value
        // overshoots, smaller positives may still fit, so skip rather than
        // break.
        if values[i] > &BigDecimal::zero() && &next - target > *tolerance && chosen.len() + 1 >= max_group
        {
            continue;
        }
        chosen.push(i);
        dfs(
            values, target, tolerance, max_group, max_nodes, i + 1, &next, chosen, search,
        );
        chosen.pop();
        if search.cap_hit {
            return;
        }
    }
}
