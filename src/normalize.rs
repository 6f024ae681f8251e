use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{Datelike, NaiveDate};

use crate::config::MatchConfig;
use crate::error::{ReconError, Result};
use crate::gstin::{GstinCache, GstinValidity};
use crate::models::{FilingPeriod, GstinConfidence, InvoiceRecord, RawRecord};

/// Accepted date formats, first match wins. Day-first forms come before ISO
/// because that is what Indian invoices carry; two-digit years last.
const DATE_FORMATS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%d/%m/%y", "%d-%m-%y", "%d.%m.%y",
];

/// Field aliases seen across extraction sources. Canonical name first.
const GSTIN_KEYS: &[&str] = &["counterparty_gstin", "seller_gstin", "buyer_gstin"];
const INVOICE_NO_KEYS: &[&str] = &["invoice_number", "invoice_no", "bill_no"];
const DATE_KEYS: &[&str] = &["invoice_date", "date", "bill_date"];
const VALUE_KEYS: &[&str] = &["taxable_value", "grand_total"];
const RATE_KEYS: &[&str] = &["tax_rate", "tax_percentage"];
const TAX_KEYS: &[&str] = &["tax_amount", "total_tax"];

/// Canonicalizes raw extraction output into immutable `InvoiceRecord`s.
/// One bad record never aborts a run; the caller collects the error and
/// reports the record as excluded.
pub struct Normalizer<'a> {
    cfg: &'a MatchConfig,
    gstin_cache: &'a GstinCache,
}

impl<'a> Normalizer<'a> {
    pub fn new(cfg: &'a MatchConfig, gstin_cache: &'a GstinCache) -> Self {
        Self { cfg, gstin_cache }
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<InvoiceRecord> {
        let gstin_raw = self.mandatory(raw, GSTIN_KEYS, "counterparty_gstin")?;
        let counterparty_gstin = gstin_raw.trim().to_uppercase();

        let gstin_confidence = match self.gstin_cache.validate(&counterparty_gstin) {
            GstinValidity::Valid => GstinConfidence::Normal,
            // Checksum failure is often a one-character OCR misread of a real
            // registration; keep the record, let the indexer try recovery.
            GstinValidity::InvalidChecksum => GstinConfidence::Low,
            GstinValidity::InvalidFormat => {
                return Err(ReconError::Normalization {
                    provenance_id: raw.provenance_id.clone(),
                    field: "counterparty_gstin",
                    reason: format!("'{counterparty_gstin}' is not a structurally valid GSTIN"),
                });
            }
        };

        // Trimmed and case-folded but never reformatted: the literal form
        // feeds exact-match comparison.
        let invoice_number = self
            .mandatory(raw, INVOICE_NO_KEYS, "invoice_number")?
            .trim()
            .to_uppercase();
        if invoice_number.is_empty() {
            return Err(ReconError::Normalization {
                provenance_id: raw.provenance_id.clone(),
                field: "invoice_number",
                reason: "empty after trimming".to_string(),
            });
        }

        let date_raw = self.mandatory(raw, DATE_KEYS, "invoice_date")?;
        let invoice_date = parse_date(date_raw).ok_or_else(|| ReconError::Normalization {
            provenance_id: raw.provenance_id.clone(),
            field: "invoice_date",
            reason: format!("'{date_raw}' matches no accepted format"),
        })?;

        let rate_raw = first_field(raw, RATE_KEYS);
        let tax_raw = first_field(raw, TAX_KEYS);
        let tax_rate = rate_raw.and_then(|s| parse_decimal_clean(s.trim_end_matches('%')));
        let tax_amount = tax_raw.and_then(parse_decimal_clean);

        let value_raw = self.mandatory(raw, VALUE_KEYS, "taxable_value")?;
        let taxable_value = self.parse_value_with_repair(
            raw,
            value_raw,
            tax_rate.as_ref(),
            tax_amount.as_ref(),
        )?;

        // Derive whichever of rate/tax is missing; both absent degrades to
        // zero, which matching treats as "rates agree".
        let (tax_rate, tax_amount) = match (tax_rate, tax_amount) {
            (Some(r), Some(t)) => (r, t),
            (Some(r), None) => {
                let t = (&taxable_value * &r / BigDecimal::from(100)).round(2);
                (r, t)
            }
            (None, Some(t)) => {
                let r = if taxable_value.is_zero() {
                    BigDecimal::zero()
                } else {
                    (&t * BigDecimal::from(100) / &taxable_value).round(2)
                };
                (r, t)
            }
            (None, None) => (BigDecimal::zero(), BigDecimal::zero()),
        };

        let filing_period = match first_field(raw, &["filing_period"]) {
            Some(p) => {
                FilingPeriod::from_str(p).map_err(|reason| ReconError::Normalization {
                    provenance_id: raw.provenance_id.clone(),
                    field: "filing_period",
                    reason,
                })?
            }
            None => FilingPeriod::from_date(invoice_date),
        };

        Ok(InvoiceRecord {
            source: raw.source,
            counterparty_gstin,
            gstin_confidence,
            invoice_number,
            invoice_date,
            taxable_value,
            tax_rate,
            tax_amount,
            filing_period,
            provenance_id: raw.provenance_id.clone(),
        })
    }

    fn mandatory<'r>(
        &self,
        raw: &'r RawRecord,
        keys: &[&str],
        canonical: &'static str,
    ) -> Result<&'r str> {
        first_field(raw, keys).ok_or_else(|| ReconError::Normalization {
            provenance_id: raw.provenance_id.clone(),
            field: canonical,
            reason: "mandatory field absent".to_string(),
        })
    }

    /// Parse the taxable value, falling back to single-character OCR repair.
    /// A repaired value is accepted only when it is consistent with the
    /// declared rate-to-tax ratio; otherwise the record is rejected rather
    /// than guessed at.
    fn parse_value_with_repair(
        &self,
        raw: &RawRecord,
        value_raw: &str,
        tax_rate: Option<&BigDecimal>,
        tax_amount: Option<&BigDecimal>,
    ) -> Result<BigDecimal> {
        if let Some(v) = parse_decimal_clean(value_raw) {
            return Ok(v);
        }

        let repaired = parse_decimal_clean(&repair_ocr_digits(value_raw));
        if let (Some(v), Some(rate), Some(tax)) = (repaired, tax_rate, tax_amount) {
            if rate_consistent(&v, rate, tax, self.cfg.value_tolerance_pct) {
                tracing::debug!(
                    "record {}: accepted OCR-repaired taxable value '{}' -> {}",
                    raw.provenance_id,
                    value_raw,
                    v
                );
                return Ok(v);
            }
        }

        Err(ReconError::Normalization {
            provenance_id: raw.provenance_id.clone(),
            field: "taxable_value",
            reason: format!("'{value_raw}' is not a parsable amount"),
        })
    }
}

fn first_field<'r>(raw: &'r RawRecord, keys: &[&str]) -> Option<&'r str> {
    keys.iter()
        .find_map(|k| raw.get(k))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS.iter().find_map(|fmt| {
        // %Y accepts bare two-digit years as e.g. year 24; reject those so
        // "05.04.24" falls through to the %y formats and lands in 2024.
        NaiveDate::parse_from_str(s, fmt)
            .ok()
            .filter(|d| d.year() >= 1900)
    })
}

/// Strict decimal parse after stripping currency markers and thousands
/// separators. No OCR repair here.
fn parse_decimal_clean(s: &str) -> Option<BigDecimal> {
    let cleaned: String = s
        .trim()
        .trim_start_matches('₹')
        .replace("RS.", "")
        .replace("RS", "")
        .replace("INR", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

/// Common OCR digit confusions in amount fields.
fn repair_ocr_digits(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'O' | 'o' => '0',
            'l' | 'I' => '1',
            'S' => '5',
            'B' => '8',
            other => other,
        })
        .collect()
}

/// Does `taxable * rate / 100` agree with the declared tax amount within the
/// relative tolerance?
fn rate_consistent(taxable: &BigDecimal, rate: &BigDecimal, tax: &BigDecimal, tol_pct: f64) -> bool {
    let expected = taxable * rate / BigDecimal::from(100);
    let delta = (&expected - tax).abs();
    if expected.is_zero() {
        return delta.is_zero();
    }
    // delta / expected <= tol_pct / 100, kept in integer-free decimal form
    &delta * BigDecimal::from(100) <= expected.abs() * decimal_from_f64(tol_pct)
}

pub(crate) fn decimal_from_f64(v: f64) -> BigDecimal {
    use bigdecimal::FromPrimitive;
    BigDecimal::from_f64(v).unwrap_or_else(BigDecimal::zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;

    const GSTIN: &str = "27AAAPL1234C1ZE";

    fn cfg() -> MatchConfig {
        MatchConfig::default()
    }

    fn raw(provenance: &str) -> RawRecord {
        RawRecord::new(RecordSource::Purchase, provenance)
            .with_field("counterparty_gstin", GSTIN)
            .with_field("invoice_number", "INV001")
            .with_field("invoice_date", "05/04/2024")
            .with_field("taxable_value", "10,000.00")
            .with_field("tax_rate", "18%")
            .with_field("tax_amount", "1800.00")
    }

    #[test]
    fn normalizes_clean_record() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let rec = n.normalize(&raw("p1")).unwrap();
        assert_eq!(rec.counterparty_gstin, GSTIN);
        assert_eq!(rec.gstin_confidence, GstinConfidence::Normal);
        assert_eq!(rec.invoice_number, "INV001");
        assert_eq!(rec.invoice_date, NaiveDate::from_ymd_opt(2024, 4, 5).unwrap());
        assert_eq!(rec.taxable_value, BigDecimal::from(10000).with_scale(2));
        assert_eq!(rec.filing_period.to_string(), "2024-04");
    }

    #[test]
    fn missing_mandatory_field_is_rejected() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p2");
        r.fields.remove("invoice_number");
        let err = n.normalize(&r).unwrap_err();
        assert!(matches!(
            err,
            ReconError::Normalization { field: "invoice_number", .. }
        ));
    }

    #[test]
    fn date_formats_first_match_wins() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        for (input, expected) in [
            ("05/04/2024", (2024, 4, 5)),
            ("05-04-2024", (2024, 4, 5)),
            ("2024-04-05", (2024, 4, 5)),
            ("05.04.24", (2024, 4, 5)),
        ] {
            let mut r = raw("p3");
            r.fields.insert("invoice_date".into(), input.into());
            let rec = n.normalize(&r).unwrap();
            let (y, m, d) = expected;
            assert_eq!(rec.invoice_date, NaiveDate::from_ymd_opt(y, m, d).unwrap(), "{input}");
        }
    }

    #[test]
    fn unparsable_date_is_rejected() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p4");
        r.fields.insert("invoice_date".into(), "April 5th".into());
        assert!(n.normalize(&r).is_err());
    }

    #[test]
    fn ocr_repair_accepted_when_rate_consistent() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p5");
        // 'O' misread for '0'; 18% of 10000 = 1800 agrees with the tax field
        r.fields.insert("taxable_value".into(), "1000O.00".into());
        let rec = n.normalize(&r).unwrap();
        assert_eq!(rec.taxable_value, BigDecimal::from(10000).with_scale(2));
    }

    #[test]
    fn ocr_repair_rejected_when_inconsistent() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p6");
        r.fields.insert("taxable_value".into(), "1000O.00".into());
        // declared tax disagrees with 18% of the repaired value
        r.fields.insert("tax_amount".into(), "900.00".into());
        let err = n.normalize(&r).unwrap_err();
        assert!(matches!(
            err,
            ReconError::Normalization { field: "taxable_value", .. }
        ));
    }

    #[test]
    fn checksum_failure_downgrades_confidence() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p7");
        r.fields
            .insert("counterparty_gstin".into(), "27AAAPL1234C1Z5".into());
        let rec = n.normalize(&r).unwrap();
        assert_eq!(rec.gstin_confidence, GstinConfidence::Low);
    }

    #[test]
    fn malformed_gstin_is_rejected() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p8");
        r.fields.insert("counterparty_gstin".into(), "NOTAGSTIN".into());
        assert!(n.normalize(&r).is_err());
    }

    #[test]
    fn missing_tax_amount_is_derived_from_rate() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let mut r = raw("p9");
        r.fields.remove("tax_amount");
        let rec = n.normalize(&r).unwrap();
        assert_eq!(rec.tax_amount, BigDecimal::from(1800).with_scale(2));
    }

    #[test]
    fn explicit_filing_period_overrides_date() {
        let cache = GstinCache::new();
        let config = cfg();
        let n = Normalizer::new(&config, &cache);
        let r = raw("p10").with_field("filing_period", "2024-05");
        let rec = n.normalize(&r).unwrap();
        assert_eq!(rec.filing_period.to_string(), "2024-05");
    }
}
