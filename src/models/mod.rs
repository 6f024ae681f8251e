pub mod assignment;
pub mod discrepancy;
pub mod record;
pub mod run;

pub use assignment::{FieldDiffs, MatchAssignment, MatchCandidatePair, MatchType};
pub use discrepancy::{Discrepancy, DiscrepancyCategory};
pub use record::{
    ExcludedRecord, FilingPeriod, GstinConfidence, InvoiceRecord, PurchaseRecordRow, RawRecord,
    RecordSource, SalesLedgerRow,
};
pub use run::{ReconciliationRun, RunStatus, RunSummary};
