use std::path::Path;

use sqlx::PgPool;

use crate::error::{ReconError, Result};
use crate::models::{
    FilingPeriod, PurchaseRecordRow, RawRecord, ReconciliationRun, SalesLedgerRow,
};

/// Raw purchase-side records for a period, as extracted upstream. Everything
/// stays text until the normalizer has looked at it.
pub async fn load_purchase_records(
    pool: &PgPool,
    period: FilingPeriod,
) -> Result<Vec<RawRecord>> {
    let rows = sqlx::query_as::<_, PurchaseRecordRow>(
        r#"
        SELECT fprovid, fgstin, finvno, finvdate, ftaxable, ftaxrate, ftaxamount, fperiod
        FROM t_gst_purchase_record
        WHERE fperiod = $1
        ORDER BY fprovid
        "#,
    )
    .bind(period.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(RawRecord::from).collect())
}

/// Sales-side records reported by counterparties, fetched from the authority
/// ledger mirror.
pub async fn load_sales_records(pool: &PgPool, period: FilingPeriod) -> Result<Vec<RawRecord>> {
    let rows = sqlx::query_as::<_, SalesLedgerRow>(
        r#"
        SELECT fprovid, fgstin, finvno, finvdate, ftaxable, ftaxrate, ftaxamount, fperiod
        FROM t_gst_sales_ledger
        WHERE fperiod = $1
        ORDER BY fprovid
        "#,
    )
    .bind(period.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(RawRecord::from).collect())
}

/// Append a finalized run. Strictly insert-only: a re-run writes a new row
/// under a new run id, and no update path exists anywhere in this module.
pub async fn insert_run(pool: &PgPool, run: &ReconciliationRun) -> Result<()> {
    let summary = serde_json::to_value(&run.summary)?;
    let assignments = serde_json::to_value(&run.assignments)?;
    let discrepancies = serde_json::to_value(&run.discrepancies)?;

    tracing::debug!("inserting run {} ({} assignment(s))", run.run_id, run.assignments.len());
    let started = std::time::Instant::now();

    let insert = sqlx::query(
        r#"
        INSERT INTO t_gst_recon_run (
            frunid, fperiod, fstatus,
            fsummary, fassignments, fdiscrepancies,
            fprocessedbuckets, fgeneratedat
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&run.run_id)
    .bind(run.period.to_string())
    .bind(run.status.to_string())
    .bind(summary)
    .bind(assignments)
    .bind(discrepancies)
    .bind(&run.processed_buckets)
    .bind(run.generated_at)
    .execute(pool);

    // 30 second guard so a wedged insert cannot hold the period hostage
    match tokio::time::timeout(std::time::Duration::from_secs(30), insert).await {
        Ok(Ok(result)) => {
            tracing::info!(
                "run {} persisted, {} row(s), took {:?}",
                run.run_id,
                result.rows_affected(),
                started.elapsed()
            );
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("run {} insert failed after {:?}: {e:?}", run.run_id, started.elapsed());
            Err(e.into())
        }
        Err(_) => {
            tracing::error!("run {} insert timed out (>30s)", run.run_id);
            Err(ReconError::Db(sqlx::Error::PoolTimedOut))
        }
    }
}

/// Export a run's assignments to CSV for downstream return preparation.
pub fn export_assignments_csv(run: &ReconciliationRun, output_path: &Path) -> Result<()> {
    use csv::Writer;
    use std::fs::File;

    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);

    writer.write_record([
        "run_id",
        "period",
        "match_type",
        "confidence",
        "purchase_ids",
        "sales_ids",
    ])?;
    for assignment in &run.assignments {
        writer.write_record([
            run.run_id.clone(),
            run.period.to_string(),
            assignment.match_type.to_string(),
            format!("{:.4}", assignment.confidence),
            assignment.purchase_ids.join("|"),
            assignment.sales_ids.join("|"),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
