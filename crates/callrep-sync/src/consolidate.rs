use std::sync::Arc;

use callrep_core::{AgentPeriodRecord, Period, RawAgentRow, ReportEntry};
use callrep_storage::{ReportStore, UpsertOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::period::resolve_period_at;
use crate::SyncError;

/// How each row's period is obtained during consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodMode {
    /// Per-row resolution through the fallback chain, with an optional explicit override.
    Resolve { explicit: Option<Period> },
    /// Every row lands in the given period (repair of an already-resolved report).
    Fixed(Period),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationTally {
    pub rows_seen: usize,
    pub agents_saved: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub agents_failed: usize,
    pub degraded_rows: usize,
}

impl ConsolidationTally {
    fn absorb(&mut self, other: ConsolidationTally) {
        self.rows_seen += other.rows_seen;
        self.agents_saved += other.agents_saved;
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.agents_failed += other.agents_failed;
        self.degraded_rows += other.degraded_rows;
    }
}

/// Turns extracted rows into the single record per `(agent_name, year, month)`.
#[derive(Clone)]
pub struct AgentConsolidator {
    store: Arc<dyn ReportStore>,
}

impl AgentConsolidator {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    /// Replace-on-conflict write of one row. Fields absent from `row` are not carried
    /// over from an earlier record for the same key.
    pub async fn upsert_agent(
        &self,
        row: RawAgentRow,
        period: Period,
        run_id: &str,
        report_timestamp: Option<JsonValue>,
    ) -> Result<UpsertOutcome, SyncError> {
        let record = agent_record(row, period, run_id, report_timestamp)?;
        let outcome = self.store.upsert_agent(record).await?;
        Ok(outcome)
    }

    /// Best-effort consolidation of a whole run payload. Row failures are logged and
    /// counted; only a store outage aborts the batch.
    pub async fn consolidate_entries(
        &self,
        entries: &[ReportEntry],
        run_id: &str,
        mode: PeriodMode,
    ) -> Result<ConsolidationTally, SyncError> {
        let mut tally = ConsolidationTally::default();
        for (entry_index, entry) in entries.iter().enumerate() {
            let entry_tally = self.consolidate_entry(entry, entry_index, run_id, mode).await?;
            tally.absorb(entry_tally);
        }
        Ok(tally)
    }

    async fn consolidate_entry(
        &self,
        entry: &ReportEntry,
        entry_index: usize,
        run_id: &str,
        mode: PeriodMode,
    ) -> Result<ConsolidationTally, SyncError> {
        let mut tally = ConsolidationTally::default();
        let entry_timestamp = entry.timestamp();
        let now = Utc::now();

        for (row_position, decoded) in entry.agent_rows().into_iter().enumerate() {
            tally.rows_seen += 1;
            let row = match decoded {
                Ok(row) => row,
                Err(err) => {
                    warn!(run_id, entry_index, row_position, error = %err, "skipping undecodable agent row");
                    tally.agents_failed += 1;
                    continue;
                }
            };

            let period = match mode {
                PeriodMode::Fixed(period) => period,
                PeriodMode::Resolve { explicit } => {
                    let resolved = resolve_period_at(
                        &[row.timestamp.as_ref(), entry_timestamp],
                        run_id,
                        explicit,
                        now,
                    );
                    if resolved.source.is_degraded() {
                        tally.degraded_rows += 1;
                    }
                    resolved.period
                }
            };

            let report_timestamp = row
                .timestamp
                .clone()
                .or_else(|| entry_timestamp.cloned());
            let agent_name = row.agent_name.clone().unwrap_or_default();

            match self.upsert_agent(row, period, run_id, report_timestamp).await {
                Ok(outcome) => {
                    tally.agents_saved += 1;
                    match outcome {
                        UpsertOutcome::Inserted => tally.inserted += 1,
                        UpsertOutcome::Replaced => tally.replaced += 1,
                    }
                    debug!(run_id, agent_name = %agent_name, period = %period, ?outcome, "agent upserted");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        run_id,
                        entry_index,
                        row_position,
                        agent_name = %agent_name,
                        error = %err,
                        "agent upsert skipped"
                    );
                    tally.agents_failed += 1;
                }
            }
        }

        Ok(tally)
    }
}

fn agent_record(
    row: RawAgentRow,
    period: Period,
    run_id: &str,
    report_timestamp: Option<JsonValue>,
) -> Result<AgentPeriodRecord, SyncError> {
    let agent_name = row
        .agent_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SyncError::InvalidRow("missing agent_name".to_string()))?;

    Ok(AgentPeriodRecord {
        id: Uuid::new_v4(),
        agent_name,
        agent_number: row.agent_number,
        period,
        run_id: run_id.to_string(),
        report_timestamp,
        last_updated: Utc::now(),
        incoming_calls: row.incoming_calls,
        outgoing_calls: row.outgoing_calls,
        actions: row.actions,
        row_index: row.row_index,
        call_details: row.call_details,
    })
}
