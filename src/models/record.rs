use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which side of the reconciliation a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Purchase,
    Sales,
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Purchase => write!(f, "purchase"),
            Self::Sales => write!(f, "sales"),
        }
    }
}

/// Confidence in the counterparty GSTIN. `Low` marks a checksum failure that
/// may be an OCR misread; such records still participate in matching but are
/// also offered to edit-distance-1 buckets for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GstinConfidence {
    Normal,
    Low,
}

/// Statutory monthly reporting window an invoice is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilingPeriod {
    pub year: i32,
    pub month: u32,
}

impl FilingPeriod {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for FilingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for FilingPeriod {
    type Err = String;

    /// Accepts `YYYY-MM` and the authority's `MMYYYY` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (year, month) = if let Some((y, m)) = s.split_once('-') {
            (
                y.parse::<i32>().map_err(|e| e.to_string())?,
                m.parse::<u32>().map_err(|e| e.to_string())?,
            )
        } else if s.len() == 6 && s.chars().all(|c| c.is_ascii_digit()) {
            (
                s[2..].parse::<i32>().map_err(|e| e.to_string())?,
                s[..2].parse::<u32>().map_err(|e| e.to_string())?,
            )
        } else {
            return Err(format!("unrecognized filing period '{s}'"));
        };
        if !(1..=12).contains(&month) {
            return Err(format!("month {month} out of range"));
        }
        Ok(Self { year, month })
    }
}

/// Raw key-value record from an upstream extraction source. No field presence
/// is guaranteed; the normalizer validates everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: RecordSource,
    pub provenance_id: String,
    pub fields: HashMap<String, String>,
}

impl RawRecord {
    pub fn new(source: RecordSource, provenance_id: impl Into<String>) -> Self {
        Self {
            source,
            provenance_id: provenance_id.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|s| s.as_str())
    }
}

/// Canonical invoice record. Immutable once produced by the normalizer;
/// re-uploads supersede it under a new provenance id, never edit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub source: RecordSource,
    pub counterparty_gstin: String,
    pub gstin_confidence: GstinConfidence,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub taxable_value: BigDecimal,
    pub tax_rate: BigDecimal,
    pub tax_amount: BigDecimal,
    pub filing_period: FilingPeriod,
    pub provenance_id: String,
}

/// A record dropped during normalization, reported in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedRecord {
    pub provenance_id: String,
    pub source: RecordSource,
    pub reason: String,
}

/// Raw purchase-side row as stored by the extraction collaborator. All fields
/// are kept as text; OCR output is not trusted until normalized.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PurchaseRecordRow {
    pub fprovid: String,
    pub fgstin: Option<String>,
    pub finvno: Option<String>,
    pub finvdate: Option<String>,
    pub ftaxable: Option<String>,
    pub ftaxrate: Option<String>,
    pub ftaxamount: Option<String>,
    pub fperiod: Option<String>,
}

/// Sales-side row fetched from the tax authority ledger. Authority data is
/// pre-normalized to the same mandatory field set.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SalesLedgerRow {
    pub fprovid: String,
    pub fgstin: String,
    pub finvno: String,
    pub finvdate: String,
    pub ftaxable: String,
    pub ftaxrate: Option<String>,
    pub ftaxamount: Option<String>,
    pub fperiod: Option<String>,
}

fn insert_opt(fields: &mut HashMap<String, String>, key: &str, value: Option<String>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), v);
    }
}

impl From<PurchaseRecordRow> for RawRecord {
    fn from(row: PurchaseRecordRow) -> Self {
        let mut fields = HashMap::new();
        insert_opt(&mut fields, "counterparty_gstin", row.fgstin);
        insert_opt(&mut fields, "invoice_number", row.finvno);
        insert_opt(&mut fields, "invoice_date", row.finvdate);
        insert_opt(&mut fields, "taxable_value", row.ftaxable);
        insert_opt(&mut fields, "tax_rate", row.ftaxrate);
        insert_opt(&mut fields, "tax_amount", row.ftaxamount);
        insert_opt(&mut fields, "filing_period", row.fperiod);
        Self {
            source: RecordSource::Purchase,
            provenance_id: row.fprovid,
            fields,
        }
    }
}

impl From<SalesLedgerRow> for RawRecord {
    fn from(row: SalesLedgerRow) -> Self {
        let mut fields = HashMap::new();
        fields.insert("counterparty_gstin".to_string(), row.fgstin);
        fields.insert("invoice_number".to_string(), row.finvno);
        fields.insert("invoice_date".to_string(), row.finvdate);
        fields.insert("taxable_value".to_string(), row.ftaxable);
        insert_opt(&mut fields, "tax_rate", row.ftaxrate);
        insert_opt(&mut fields, "tax_amount", row.ftaxamount);
        insert_opt(&mut fields, "filing_period", row.fperiod);
        Self {
            source: RecordSource::Sales,
            provenance_id: row.fprovid,
            fields,
        }
    }
}
