use std::collections::BTreeMap;
use std::fmt;

use crate::gstin::within_edit_distance_one;
use crate::models::{FilingPeriod, GstinConfidence, InvoiceRecord, RecordSource};

/// Bucket identity: one counterparty, one filing period.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub gstin: String,
    pub period: FilingPeriod,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gstin, self.period)
    }
}

/// Purchase and sales records sharing a bucket key. Matching never crosses
/// bucket boundaries, which bounds pairwise comparison to the bucket size.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub key: BucketKey,
    pub purchases: Vec<InvoiceRecord>,
    pub sales: Vec<InvoiceRecord>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.purchases.len() + self.sales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.purchases.is_empty() && self.sales.is_empty()
    }
}

/// Records grouped by (counterparty GSTIN, filing period). Iteration order is
/// key order, so downstream processing is reproducible.
#[derive(Debug, Default)]
pub struct CandidateIndex {
    buckets: BTreeMap<BucketKey, Bucket>,
}

impl CandidateIndex {
    /// Every record lands in exactly one home bucket; input order within a
    /// bucket is preserved.
    pub fn build(records: Vec<InvoiceRecord>) -> Self {
        let mut buckets: BTreeMap<BucketKey, Bucket> = BTreeMap::new();
        for record in records {
            let key = BucketKey {
                gstin: record.counterparty_gstin.clone(),
                period: record.filing_period,
            };
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                key,
                purchases: Vec::new(),
                sales: Vec::new(),
            });
            match record.source {
                RecordSource::Purchase => bucket.purchases.push(record),
                RecordSource::Sales => bucket.sales.push(record),
            }
        }
        Self { buckets }
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    pub fn into_buckets(self) -> Vec<Bucket> {
        self.buckets.into_values().collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&Bucket> {
        self.buckets.get(key)
    }

    /// Recovery candidates for a low-confidence record: up to `top_k` other
    /// buckets in the same filing period whose GSTIN is within edit distance
    /// one of the record's. Key order keeps the candidate list deterministic.
    pub fn recovery_candidates(&self, record: &InvoiceRecord, top_k: usize) -> Vec<BucketKey> {
        if record.gstin_confidence != GstinConfidence::Low {
            return Vec::new();
        }
        self.buckets
            .keys()
            .filter(|k| k.period == record.filing_period)
            .filter(|k| k.gstin != record.counterparty_gstin)
            .filter(|k| within_edit_distance_one(&k.gstin, &record.counterparty_gstin))
            .take(top_k)
            .cloned()
            .collect()
    }
}
