pub mod classifier;
pub mod matcher;
pub mod reconciler;
pub mod report;

pub use classifier::Classifier;
pub use matcher::{BucketOutcome, Matcher};
pub use reconciler::{CancelToken, Reconciler};
pub use report::{build_run, ReportInputs};
