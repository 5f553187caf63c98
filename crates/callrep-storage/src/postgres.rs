use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use callrep_core::{
    AgentKey, AgentPeriodRecord, JobRecord, LegacyAgentRecord, NewRawReport, Period, PeriodSource,
    RawReport, ReportEntry, ReportSummary,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{AgentTotals, ReportStore, StoreError, UpsertOutcome};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateKey(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

const PERIOD_INDEX: &str = "agent_records_period_key";

/// Postgres raises 42P10 when `ON CONFLICT` names columns without a matching unique index.
fn is_missing_conflict_target(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42P10"))
}

/// PostgreSQL document store: indexed key columns plus the full document as JSONB.
///
/// Upserts use `ON CONFLICT` while the unique period index is known to exist and a
/// keyed update-or-insert under an advisory lock otherwise.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    period_index: Arc<AtomicBool>,
}

impl PgStore {
    /// Starts on the keyed upsert path until the period index is confirmed.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            period_index: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connects, applies migrations and tries to establish the period index.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        if let Err(err) = store.ensure_period_index().await {
            warn!(error = %err, "agent period index not in place; run dedupe to restore it");
            store.refresh_period_index().await?;
        }
        info!("connected to postgres document store");
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn has_period_index(&self) -> bool {
        self.period_index.load(Ordering::Acquire)
    }

    /// Re-reads whether the unique period index exists.
    pub async fn refresh_period_index(&self) -> Result<bool, StoreError> {
        let present: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE tablename = 'agent_records' AND indexname = $1)",
        )
        .bind(PERIOD_INDEX)
        .fetch_one(&self.pool)
        .await?;
        self.period_index.store(present, Ordering::Release);
        Ok(present)
    }

    async fn upsert_on_conflict(
        &self,
        record: &AgentPeriodRecord,
        doc: JsonValue,
    ) -> Result<UpsertOutcome, sqlx::Error> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO agent_records (id, agent_name, year, month, run_id, last_updated, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (agent_name, year, month) DO UPDATE
               SET run_id = EXCLUDED.run_id,
                   last_updated = EXCLUDED.last_updated,
                   doc = EXCLUDED.doc || jsonb_build_object('id', agent_records.id)
            RETURNING (xmax = 0)
            "#,
        )
        .bind(record.id)
        .bind(&record.agent_name)
        .bind(record.period.year)
        .bind(record.period.month as i32)
        .bind(&record.run_id)
        .bind(record.last_updated)
        .bind(doc)
        .fetch_one(&self.pool)
        .await?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Replaced
        })
    }

    /// Update-or-insert by key, serialized per key with a transaction-scoped advisory lock.
    /// When duplicates already exist the most recently updated one is overwritten.
    async fn upsert_by_key(&self, record: AgentPeriodRecord) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("agent_records/{}/{}", record.agent_name, record.period))
            .execute(&mut *tx)
            .await?;
        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM agent_records
             WHERE agent_name = $1 AND year = $2 AND month = $3
             ORDER BY last_updated DESC NULLS LAST
             LIMIT 1
            "#,
        )
        .bind(&record.agent_name)
        .bind(record.period.year)
        .bind(record.period.month as i32)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(id) => {
                let record = AgentPeriodRecord { id, ..record };
                let doc = serde_json::to_value(&record)?;
                sqlx::query("UPDATE agent_records SET run_id = $2, last_updated = $3, doc = $4 WHERE id = $1")
                    .bind(id)
                    .bind(&record.run_id)
                    .bind(record.last_updated)
                    .bind(doc)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::Replaced
            }
            None => {
                let doc = serde_json::to_value(&record)?;
                sqlx::query(
                    r#"
                    INSERT INTO agent_records (id, agent_name, year, month, run_id, last_updated, doc)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(record.id)
                .bind(&record.agent_name)
                .bind(record.period.year)
                .bind(record.period.month as i32)
                .bind(&record.run_id)
                .bind(record.last_updated)
                .bind(doc)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }
}

fn period_from_columns(year: i32, month: i32) -> Result<Period, StoreError> {
    u32::try_from(month)
        .ok()
        .and_then(|m| Period::new(year, m))
        .ok_or_else(|| StoreError::Backend(format!("stored period {year}-{month} is invalid")))
}

fn period_source_from_str(value: &str) -> PeriodSource {
    match value {
        "explicit" => PeriodSource::Explicit,
        "record_timestamp" => PeriodSource::RecordTimestamp,
        "run_id" => PeriodSource::RunId,
        _ => PeriodSource::ProcessingTime,
    }
}

fn summary_from_row(row: &PgRow) -> Result<ReportSummary, StoreError> {
    let year: i32 = row.try_get("year")?;
    let month: i32 = row.try_get("month")?;
    let period = period_from_columns(year, month)?;
    let source: String = row.try_get("period_source")?;
    let row_count: i32 = row.try_get("row_count")?;
    let agent_row_count: i32 = row.try_get("agent_row_count")?;
    Ok(ReportSummary {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        seq: row.try_get("seq")?,
        saved_at: row.try_get("saved_at")?,
        year: period.year,
        month: period.month,
        month_year: period.month_year(),
        period_source: period_source_from_str(&source),
        row_count: row_count.max(0) as usize,
        agent_row_count: agent_row_count.max(0) as usize,
    })
}

fn report_from_row(row: &PgRow) -> Result<RawReport, StoreError> {
    let summary = summary_from_row(row)?;
    let rows: JsonValue = row.try_get("rows")?;
    let rows: Vec<ReportEntry> = serde_json::from_value(rows)?;
    Ok(RawReport {
        id: summary.id,
        run_id: summary.run_id,
        seq: summary.seq,
        saved_at: summary.saved_at,
        period: period_from_columns(summary.year, summary.month as i32)?,
        period_source: summary.period_source,
        row_count: summary.row_count,
        agent_row_count: summary.agent_row_count,
        rows,
    })
}

fn record_from_row(row: &PgRow) -> Result<AgentPeriodRecord, StoreError> {
    let doc: JsonValue = row.try_get("doc")?;
    Ok(serde_json::from_value(doc)?)
}

const REPORT_COLUMNS: &str =
    "id, seq, run_id, saved_at, year, month, period_source, row_count, agent_row_count";

#[async_trait]
impl ReportStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn insert_report(&self, report: NewRawReport) -> Result<RawReport, StoreError> {
        let rows = serde_json::to_value(&report.rows)?;
        let agent_row_count: usize = report.rows.iter().map(ReportEntry::agent_row_count).sum();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO raw_reports
                (id, run_id, saved_at, year, month, period_source, row_count, agent_row_count, rows)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING seq
            "#,
        )
        .bind(report.id)
        .bind(&report.run_id)
        .bind(report.saved_at)
        .bind(report.period.year)
        .bind(report.period.month as i32)
        .bind(report.period_source.as_str())
        .bind(report.rows.len() as i32)
        .bind(agent_row_count as i32)
        .bind(rows)
        .fetch_one(&self.pool)
        .await?;
        Ok(RawReport::from_new(report, seq))
    }

    async fn report_by_run_id(&self, run_id: &str) -> Result<Option<RawReport>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS}, rows FROM raw_reports WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn reports_for_period(&self, period: Period) -> Result<Vec<RawReport>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS}, rows FROM raw_reports
              WHERE year = $1 AND month = $2
              ORDER BY saved_at ASC, seq ASC"
        ))
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(report_from_row).collect()
    }

    async fn report_summaries(&self) -> Result<Vec<ReportSummary>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM raw_reports ORDER BY saved_at DESC, seq DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn upsert_agent(&self, record: AgentPeriodRecord) -> Result<UpsertOutcome, StoreError> {
        if self.has_period_index() {
            let doc = serde_json::to_value(&record)?;
            match self.upsert_on_conflict(&record, doc).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_missing_conflict_target(&err) => {
                    warn!("agent period index disappeared; switching to keyed upserts");
                    self.period_index.store(false, Ordering::Release);
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.upsert_by_key(record).await
    }

    async fn insert_agent(&self, record: AgentPeriodRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_value(&record)?;
        sqlx::query(
            r#"
            INSERT INTO agent_records (id, agent_name, year, month, run_id, last_updated, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.agent_name)
        .bind(record.period.year)
        .bind(record.period.month as i32)
        .bind(&record.run_id)
        .bind(record.last_updated)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_agent(&self, key: &AgentKey) -> Result<Option<AgentPeriodRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM agent_records
             WHERE agent_name = $1 AND year = $2 AND month = $3
             ORDER BY last_updated DESC
             LIMIT 1
            "#,
        )
        .bind(&key.agent_name)
        .bind(key.period.year)
        .bind(key.period.month as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn agents_for_period(
        &self,
        period: Period,
        run_id: Option<&str>,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM agent_records
             WHERE year = $1 AND month = $2
               AND ($3::text IS NULL OR run_id = $3)
             ORDER BY agent_name ASC
            "#,
        )
        .bind(period.year)
        .bind(period.month as i32)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn all_agents(&self) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM agent_records WHERE year IS NOT NULL AND month IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn search_agents(
        &self,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM agent_records
             WHERE year IS NOT NULL AND month IS NOT NULL
               AND strpos(lower(agent_name), lower($1)) > 0
             ORDER BY last_updated DESC
             LIMIT $2
            "#,
        )
        .bind(fragment)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn latest_agent_named(&self, name: &str) -> Result<Option<AgentPeriodRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM agent_records
             WHERE year IS NOT NULL AND month IS NOT NULL
               AND lower(agent_name) = lower($1)
             ORDER BY last_updated DESC
             LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn agent_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT DISTINCT agent_name COLLATE "C" AS agent_name FROM agent_records
             WHERE year IS NOT NULL AND month IS NOT NULL AND agent_name IS NOT NULL
             ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn agents_with_incoming_at_least(
        &self,
        min_calls: f64,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        // Mirrors `aggregate_total`: JSON numbers, or strings that parse once commas
        // and surrounding whitespace are removed.
        let rows = sqlx::query(
            r#"
            WITH totals AS (
                SELECT doc, last_updated,
                       doc->'incoming_calls'->'total' AS raw,
                       regexp_replace(replace(doc->'incoming_calls'->>'total', ',', ''), '^\s+|\s+$', '', 'g') AS cleaned
                  FROM agent_records
                 WHERE year IS NOT NULL AND month IS NOT NULL
            ), numeric_totals AS (
                SELECT doc, last_updated,
                       CASE
                           WHEN jsonb_typeof(raw) = 'number' THEN (raw #>> '{}')::double precision
                           WHEN jsonb_typeof(raw) = 'string'
                                AND cleaned ~ '^[+-]?([0-9]+\.?[0-9]*|\.[0-9]+)([eE][+-]?[0-9]+)?$'
                               THEN cleaned::double precision
                       END AS total
                  FROM totals
            )
            SELECT doc FROM numeric_totals
             WHERE total >= $1
             ORDER BY total DESC, last_updated DESC
            "#,
        )
        .bind(min_calls)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn agent_totals(&self) -> Result<AgentTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE year IS NOT NULL AND month IS NOT NULL) AS records,
                   COUNT(DISTINCT agent_name) FILTER (WHERE year IS NOT NULL AND month IS NOT NULL) AS unique_names,
                   COUNT(*) FILTER (WHERE year IS NULL OR month IS NULL) AS legacy
              FROM agent_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let count = |column: &str| -> Result<usize, StoreError> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as usize)
        };
        Ok(AgentTotals {
            records: count("records")?,
            unique_names: count("unique_names")?,
            legacy: count("legacy")?,
        })
    }

    async fn count_agents_written_by(&self, run_id: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_records WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn count_agents_in_period(&self, period: Period) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM agent_records WHERE year = $1 AND month = $2")
                .bind(period.year)
                .bind(period.month as i32)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    async fn legacy_agents(&self) -> Result<Vec<LegacyAgentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, doc FROM agent_records WHERE year IS NULL OR month IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: JsonValue = row.try_get("doc")?;
            out.push(LegacyAgentRecord {
                id: row.try_get("id")?,
                document: match doc {
                    JsonValue::Object(map) => map,
                    _ => Map::new(),
                },
            });
        }
        Ok(out)
    }

    async fn insert_legacy_agent(&self, document: Map<String, JsonValue>) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let agent_name = document
            .get("agent_name")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string);
        let run_id = document
            .get("task_id")
            .or_else(|| document.get("run_id"))
            .and_then(JsonValue::as_str)
            .map(ToString::to_string);
        let last_updated: Option<DateTime<Utc>> = document
            .get("last_updated")
            .and_then(callrep_core::parse_timestamp);
        sqlx::query(
            r#"
            INSERT INTO agent_records (id, agent_name, year, month, run_id, last_updated, doc)
            VALUES ($1, $2, NULL, NULL, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(agent_name)
        .bind(run_id)
        .bind(last_updated)
        .bind(JsonValue::Object(document))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn assign_period(&self, record: AgentPeriodRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_value(&record)?;
        let result = sqlx::query(
            r#"
            UPDATE agent_records
               SET agent_name = $2, year = $3, month = $4, run_id = $5, last_updated = $6, doc = $7
             WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.agent_name)
        .bind(record.period.year)
        .bind(record.period.month as i32)
        .bind(&record.run_id)
        .bind(record.last_updated)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent document {}", record.id)));
        }
        Ok(())
    }

    async fn delete_agents(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM agent_records WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn ensure_period_index(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {PERIOD_INDEX} ON agent_records (agent_name, year, month)"
        ))
        .execute(&self.pool)
        .await?;
        self.period_index.store(true, Ordering::Release);
        Ok(())
    }

    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_value(job)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (run_id, status, created_at, updated_at, doc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id) DO UPDATE
               SET status = EXCLUDED.status,
                   updated_at = EXCLUDED.updated_at,
                   doc = EXCLUDED.doc
            "#,
        )
        .bind(&job.run_id)
        .bind(serde_json::to_value(job.status)?.as_str().unwrap_or("queued"))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job(&self, run_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT doc FROM jobs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let doc: JsonValue = row.try_get("doc")?;
                Ok(Some(serde_json::from_value(doc)?))
            }
            None => Ok(None),
        }
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM jobs ORDER BY created_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: JsonValue = row.try_get("doc")?;
            out.push(serde_json::from_value(doc)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    /// Runs only when a scratch database is provided.
    async fn scratch_store() -> Option<PgStore> {
        let url = std::env::var("CALLREP_TEST_DATABASE_URL").ok()?;
        Some(PgStore::connect(&url, 2).await.expect("connect"))
    }

    fn record(name: &str, run_id: &str, updated: DateTime<Utc>) -> AgentPeriodRecord {
        AgentPeriodRecord {
            id: Uuid::new_v4(),
            agent_name: name.to_string(),
            agent_number: None,
            period: Period::new(2025, 1).expect("period"),
            run_id: run_id.to_string(),
            report_timestamp: None,
            last_updated: updated,
            incoming_calls: Map::new(),
            outgoing_calls: Map::new(),
            actions: String::new(),
            row_index: None,
            call_details: None,
        }
    }

    async fn rows_named(store: &PgStore, name: &str) -> Vec<(Uuid, String)> {
        sqlx::query_as("SELECT id, run_id FROM agent_records WHERE agent_name = $1 ORDER BY run_id")
            .bind(name)
            .fetch_all(store.pool())
            .await
            .expect("select")
    }

    #[tokio::test]
    async fn upsert_without_the_period_index_updates_by_key() {
        let Some(store) = scratch_store().await else {
            return;
        };
        sqlx::query(&format!("DROP INDEX IF EXISTS {PERIOD_INDEX}"))
            .execute(store.pool())
            .await
            .expect("drop index");
        assert!(!store.refresh_period_index().await.expect("refresh"));

        let name = format!("keyed-upsert-{}", Uuid::new_v4());
        let first = record(&name, "r1", Utc::now() - ChronoDuration::minutes(5));
        let first_id = first.id;
        assert_eq!(store.upsert_agent(first).await.expect("insert"), UpsertOutcome::Inserted);
        assert_eq!(
            store.upsert_agent(record(&name, "r2", Utc::now())).await.expect("replace"),
            UpsertOutcome::Replaced
        );
        assert_eq!(rows_named(&store, &name).await, vec![(first_id, "r2".to_string())]);

        // A stale flag hits 42P10 once and then stays on the keyed path.
        store.period_index.store(true, Ordering::Release);
        assert_eq!(
            store.upsert_agent(record(&name, "r3", Utc::now())).await.expect("stale flag"),
            UpsertOutcome::Replaced
        );
        assert!(!store.has_period_index());
        assert_eq!(rows_named(&store, &name).await, vec![(first_id, "r3".to_string())]);

        store.delete_agents(&[first_id]).await.expect("cleanup");
        store.ensure_period_index().await.expect("restore index");
        assert!(store.has_period_index());
    }
}
