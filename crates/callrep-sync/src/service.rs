use std::sync::Arc;

use callrep_core::{NewRawReport, Period, PeriodSource, ReportEntry};
use callrep_storage::{PayloadArchive, ReportStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::consolidate::{AgentConsolidator, PeriodMode};
use crate::period::{explicit_period, resolve_period_at};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub report_id: Uuid,
    pub run_id: String,
    #[serde(flatten)]
    pub period: Period,
    pub period_source: PeriodSource,
    pub entries: usize,
    pub agent_rows: usize,
    pub agents_saved: usize,
    pub agents_failed: usize,
    pub degraded_rows: usize,
}

/// Entry point for the job trigger, the query surface and the admin surface.
#[derive(Clone)]
pub struct ReportService {
    pub(crate) store: Arc<dyn ReportStore>,
    pub(crate) consolidator: AgentConsolidator,
    archive: Option<PayloadArchive>,
}

impl ReportService {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self {
            consolidator: AgentConsolidator::new(store.clone()),
            store,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    pub fn consolidator(&self) -> &AgentConsolidator {
        &self.consolidator
    }

    /// Stores the run payload under its resolved period, then consolidates every agent
    /// row into the per-agent monthly records.
    ///
    /// The raw report is written before any agent so that an interrupted consolidation
    /// can be replayed with `repair_run`.
    pub async fn save_report(
        &self,
        rows: Vec<ReportEntry>,
        run_id: &str,
        year: Option<i32>,
        month: Option<u32>,
    ) -> Result<SaveOutcome, SyncError> {
        let now = Utc::now();
        let explicit = explicit_period(year, month);
        let resolved = {
            let candidates = rows.iter().map(ReportEntry::timestamp).collect::<Vec<_>>();
            resolve_period_at(&candidates, run_id, explicit, now)
        };

        if let Some(archive) = &self.archive {
            match archive.archive_run(run_id, resolved.period, now, &rows).await {
                Ok(archived) => info!(
                    run_id,
                    path = %archived.path.display(),
                    already_archived = archived.already_archived,
                    "archived run payload"
                ),
                Err(err) => warn!(run_id, error = %err, "payload archive write failed"),
            }
        }

        let report = self
            .store
            .insert_report(NewRawReport {
                id: Uuid::new_v4(),
                run_id: run_id.to_string(),
                saved_at: now,
                period: resolved.period,
                period_source: resolved.source,
                rows,
            })
            .await?;

        let tally = self
            .consolidator
            .consolidate_entries(&report.rows, run_id, PeriodMode::Resolve { explicit })
            .await?;

        info!(
            run_id,
            report_id = %report.id,
            period = %report.period,
            period_source = report.period_source.as_str(),
            entries = report.row_count,
            agents_saved = tally.agents_saved,
            agents_failed = tally.agents_failed,
            "saved report"
        );

        Ok(SaveOutcome {
            report_id: report.id,
            run_id: report.run_id,
            period: report.period,
            period_source: report.period_source,
            entries: report.row_count,
            agent_rows: tally.rows_seen,
            agents_saved: tally.agents_saved,
            agents_failed: tally.agents_failed,
            degraded_rows: tally.degraded_rows,
        })
    }
}
