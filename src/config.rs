use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default, rename = "match")]
    pub match_config: MatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

/// Engine tunables. Tolerances, thresholds, and similarity weights are
/// deliberate defaults rather than statutory constants, so every one of them
/// is configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Invoice dates further apart than this never pair (absorbs
    /// filing-period boundary skew).
    pub date_window_days: i64,
    /// Relative taxable-value tolerance in percent (absorbs rounding).
    pub value_tolerance_pct: f64,
    /// Similarity score at or above which a pair is an exact match.
    pub exact_threshold: f64,
    /// Score at or above which a pair is a fuzzy match; below it the pair is
    /// discarded.
    pub fuzzy_threshold: f64,
    /// Buckets larger than this are flagged oversized and matched with the
    /// strict pruning pass instead of the full pairwise comparison.
    pub max_bucket_size: usize,
    /// Largest group size considered by the split pass.
    pub max_split_group: usize,
    /// Node budget for one split subset search.
    pub split_max_nodes: u64,
    /// How many edit-distance-1 buckets a low-confidence record is offered to.
    pub edit_distance_top_k: usize,
    /// Overall job deadline; exceeding it fails the run preserving partials.
    pub job_deadline_secs: u64,
    pub weight_invoice_number: f64,
    pub weight_date: f64,
    pub weight_value: f64,
    pub weight_rate: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/gst_recon".to_string()),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            date_window_days: 3,
            value_tolerance_pct: 1.0,
            exact_threshold: 0.9,
            fuzzy_threshold: 0.65,
            max_bucket_size: 200,
            max_split_group: 6,
            split_max_nodes: 50_000,
            edit_distance_top_k: 3,
            job_deadline_secs: 300,
            weight_invoice_number: 0.6,
            weight_date: 0.1,
            weight_value: 0.2,
            weight_rate: 0.1,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.exact_threshold) || !in_unit(self.fuzzy_threshold) {
            return Err(ReconError::Config(
                "exact_threshold and fuzzy_threshold must lie in [0, 1]".to_string(),
            ));
        }
        if self.fuzzy_threshold > self.exact_threshold {
            return Err(ReconError::Config(format!(
                "fuzzy_threshold {} exceeds exact_threshold {}",
                self.fuzzy_threshold, self.exact_threshold
            )));
        }
        if self.value_tolerance_pct < 0.0 {
            return Err(ReconError::Config(
                "value_tolerance_pct must be non-negative".to_string(),
            ));
        }
        if self.date_window_days < 0 {
            return Err(ReconError::Config(
                "date_window_days must be non-negative".to_string(),
            ));
        }
        if self.max_split_group < 2 {
            return Err(ReconError::Config(
                "max_split_group must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Layer an optional `Recon.toml` and `RECON_*` environment variables
    /// over the defaults.
    pub fn load() -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name("Recon").required(false))
            .add_source(config::Environment::with_prefix("RECON").separator("__"))
            .build()
            .map_err(|e| ReconError::Config(e.to_string()))?;
        let app: AppConfig = raw
            .try_deserialize()
            .map_err(|e| ReconError::Config(e.to_string()))?;
        app.match_config.validate()?;
        Ok(app)
    }
}
