pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod gstin;
pub mod index;
pub mod models;
pub mod normalize;
pub mod service;

pub use config::{AppConfig, MatchConfig};
pub use db::create_pool;
pub use error::{ReconError, Result};
pub use service::{CancelToken, Reconciler};
