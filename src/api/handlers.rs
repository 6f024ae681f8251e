use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::db;
use crate::error::ReconError;
use crate::models::{FilingPeriod, RunStatus, RunSummary};
use crate::service::{CancelToken, Reconciler};

/// Shared state for the reconcile endpoints.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub reconciler: Arc<Reconciler>,
}

/// Request body: filing periods to reconcile, `YYYY-MM`.
#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub periods: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PeriodResult {
    pub period: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub success: bool,
    pub message: String,
    pub results: Vec<PeriodResult>,
}

/// Health check
pub async fn health_check() -> &'static str {
    "OK"
}

/// Reconcile one or more filing periods. Periods are independent units of
/// work with no shared mutable state, so they run concurrently. A partial
/// run is a successful response with its status spelled out, never a silent
/// truncation.
pub async fn reconcile(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Response {
    let period_count = req.periods.len();
    let futures = req
        .periods
        .into_iter()
        .map(|p| reconcile_period(state.clone(), p));
    let results: Vec<PeriodResult> = join_all(futures).await;

    let succeeded = results.iter().filter(|r| r.success).count();
    let all_ok = succeeded == period_count;
    let response = ReconcileResponse {
        success: all_ok,
        message: format!("Reconciled {succeeded}/{period_count} period(s)"),
        results,
    };
    let code = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(response)).into_response()
}

async fn reconcile_period(state: AppState, period_str: String) -> PeriodResult {
    let period = match FilingPeriod::from_str(&period_str) {
        Ok(p) => p,
        Err(reason) => {
            return PeriodResult {
                period: period_str,
                success: false,
                message: format!("bad period: {reason}"),
                run_id: None,
                status: None,
                summary: None,
            };
        }
    };

    match run_period(&state, period).await {
        Ok(run) => PeriodResult {
            period: period_str,
            success: true,
            message: format!("run {} finished: {}", run.run_id, run.status),
            run_id: Some(run.run_id),
            status: Some(run.status),
            summary: Some(run.summary),
        },
        Err(e) => {
            tracing::error!("period {period_str} reconciliation failed: {e}");
            PeriodResult {
                period: period_str,
                success: false,
                message: format!("Error: {e}"),
                run_id: None,
                status: None,
                summary: None,
            }
        }
    }
}

async fn run_period(
    state: &AppState,
    period: FilingPeriod,
) -> crate::error::Result<crate::models::ReconciliationRun> {
    let mut records = db::load_purchase_records(&state.pool, period).await?;
    records.extend(db::load_sales_records(&state.pool, period).await?);
    tracing::info!("period {period}: loaded {} raw record(s)", records.len());

    // The engine is pure CPU; keep it off the async workers.
    let reconciler = Arc::clone(&state.reconciler);
    let cancel = CancelToken::new();
    let run = tokio::task::spawn_blocking(move || reconciler.run(period, records, &cancel))
        .await
        .map_err(|e| ReconError::Config(format!("reconcile task panicked: {e}")))?;

    // A timed-out run still gets persisted with its partial results before
    // the error surfaces to the caller.
    match run {
        Ok(run) => {
            db::insert_run(&state.pool, &run).await?;
            Ok(run)
        }
        Err(ReconError::RunTimeout {
            period,
            completed_buckets,
            partial,
        }) => {
            db::insert_run(&state.pool, &partial).await?;
            Err(ReconError::RunTimeout {
                period,
                completed_buckets,
                partial,
            })
        }
        Err(other) => Err(other),
    }
}
