use std::collections::{BTreeMap, HashMap};

use callrep_core::{
    timestamp_period, AgentKey, AgentPeriodRecord, LegacyAgentRecord, LegacyPeriodSource, Period,
    RawReport,
};
use callrep_storage::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};
use uuid::Uuid;

use crate::consolidate::PeriodMode;
use crate::service::ReportService;
use crate::{validated_period, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRepairSummary {
    pub run_id: String,
    pub year: i32,
    pub month: u32,
    pub saved_at: DateTime<Utc>,
    pub agents_before: usize,
    pub agents_after: usize,
    pub agents_processed: usize,
    pub agents_failed: usize,
    pub agents_added: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRepairSummary {
    pub year: i32,
    pub month: u32,
    pub total_reports: usize,
    pub reports_processed: usize,
    pub total_agents_before: usize,
    pub total_agents_after: usize,
    pub agents_added: i64,
    pub report_details: Vec<RunRepairSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub id: Uuid,
    pub agent_name: Option<String>,
    pub agent_number: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub inspected: usize,
    pub recovered: usize,
    pub recovered_by: BTreeMap<LegacyPeriodSource, usize>,
    /// Recovered records that collided with an existing key; the newer one was kept.
    pub merged_conflicts: usize,
    pub deleted: Vec<DeletedRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeSummary {
    pub total_records: usize,
    pub unique_keys: usize,
    pub duplicate_groups: usize,
    pub records_deleted: usize,
    pub index_restored: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub backfill: BackfillSummary,
    pub dedupe: DedupeSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyImportSummary {
    pub received: usize,
    /// Documents stored with a usable period.
    pub imported: usize,
    /// Documents stored without a period, awaiting backfill.
    pub pending_backfill: usize,
    pub conflicts: usize,
    pub rejected: usize,
}

fn count_delta(before: usize, after: usize) -> i64 {
    i64::try_from(after).unwrap_or(i64::MAX) - i64::try_from(before).unwrap_or(i64::MAX)
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_period(year: Option<&JsonValue>, month: Option<&JsonValue>) -> Option<Period> {
    let year = i32::try_from(json_i64(year?)?).ok()?;
    let month = u32::try_from(json_i64(month?)?).ok()?;
    Period::new(year, month)
}

/// Period carried by one of the alternate fields older documents used.
fn legacy_period(document: &Map<String, JsonValue>, source: LegacyPeriodSource) -> Option<Period> {
    let value = document.get(source.field_name())?;
    match source {
        LegacyPeriodSource::MonthYearField => value.as_str().and_then(Period::parse_month_year),
        LegacyPeriodSource::PeriodObject => {
            let object = value.as_object()?;
            json_period(object.get("year"), object.get("month"))
        }
        LegacyPeriodSource::ReportTimestamp | LegacyPeriodSource::LastUpdated => {
            timestamp_period(value)
        }
    }
}

/// First recoverable period in fixed priority order.
pub(crate) fn recover_period(document: &Map<String, JsonValue>) -> Option<(Period, LegacyPeriodSource)> {
    LegacyPeriodSource::PRIORITY
        .iter()
        .find_map(|source| legacy_period(document, *source).map(|period| (period, *source)))
}

fn superseded_record(record: &AgentPeriodRecord) -> DeletedRecord {
    DeletedRecord {
        id: record.id,
        agent_name: Some(record.agent_name.clone()),
        agent_number: record.agent_number.clone(),
        reason: "superseded by newer record".to_string(),
    }
}

fn deleted_record(legacy: &LegacyAgentRecord, reason: &str) -> DeletedRecord {
    DeletedRecord {
        id: legacy.id,
        agent_name: legacy.agent_name().map(str::to_string),
        agent_number: legacy
            .document
            .get("agent_number")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        reason: reason.to_string(),
    }
}

impl ReportService {
    /// Replays consolidation for a stored report into the period it already carries.
    pub async fn repair_run(&self, run_id: &str) -> Result<RunRepairSummary, SyncError> {
        let report = self
            .store
            .report_by_run_id(run_id)
            .await?
            .ok_or_else(|| SyncError::RunNotFound(run_id.to_string()))?;
        self.repair_report(&report).await
    }

    async fn repair_report(&self, report: &RawReport) -> Result<RunRepairSummary, SyncError> {
        let agents_before = self.store.count_agents_written_by(&report.run_id).await?;
        let tally = self
            .consolidator
            .consolidate_entries(&report.rows, &report.run_id, PeriodMode::Fixed(report.period))
            .await?;
        let agents_after = self.store.count_agents_written_by(&report.run_id).await?;

        info!(
            run_id = %report.run_id,
            period = %report.period,
            agents_before,
            agents_after,
            agents_processed = tally.agents_saved,
            "repaired run"
        );

        Ok(RunRepairSummary {
            run_id: report.run_id.clone(),
            year: report.period.year,
            month: report.period.month,
            saved_at: report.saved_at,
            agents_before,
            agents_after,
            agents_processed: tally.agents_saved,
            agents_failed: tally.agents_failed,
            agents_added: count_delta(agents_before, agents_after),
        })
    }

    /// Replays every report of a period oldest first, so the latest run's rows win again.
    pub async fn repair_period(&self, year: i32, month: u32) -> Result<PeriodRepairSummary, SyncError> {
        let period = validated_period(year, month)?;
        let reports = self.store.reports_for_period(period).await?;
        if reports.is_empty() {
            return Err(SyncError::NoReportsForPeriod(period));
        }

        let total_agents_before = self.store.count_agents_in_period(period).await?;
        let mut report_details = Vec::with_capacity(reports.len());
        for report in &reports {
            report_details.push(self.repair_report(report).await?);
        }
        let total_agents_after = self.store.count_agents_in_period(period).await?;

        info!(
            period = %period,
            reports = reports.len(),
            total_agents_before,
            total_agents_after,
            "repaired period"
        );

        Ok(PeriodRepairSummary {
            year,
            month,
            total_reports: reports.len(),
            reports_processed: report_details.len(),
            total_agents_before,
            total_agents_after,
            agents_added: count_delta(total_agents_before, total_agents_after),
            report_details,
        })
    }

    /// Gives period-less agent documents a period from their legacy fields and deletes
    /// the ones with nothing to recover. Deletion is permanent.
    pub async fn backfill_missing_periods(&self) -> Result<BackfillSummary, SyncError> {
        let legacy = self.store.legacy_agents().await?;
        let mut summary = BackfillSummary {
            inspected: legacy.len(),
            ..Default::default()
        };
        let mut doomed = Vec::new();
        let now = Utc::now();

        for document in legacy {
            if document.agent_name().is_none() {
                warn!(id = %document.id, "deleting agent record without agent_name");
                summary.deleted.push(deleted_record(&document, "missing agent_name"));
                doomed.push(document.id);
                continue;
            }

            let Some((period, source)) = recover_period(&document.document) else {
                warn!(
                    id = %document.id,
                    agent_name = document.agent_name().unwrap_or_default(),
                    fields = ?document.document.keys().collect::<Vec<_>>(),
                    "deleting agent record with no recoverable period"
                );
                summary.deleted.push(deleted_record(&document, "no recoverable period"));
                doomed.push(document.id);
                continue;
            };

            let deleted = deleted_record(&document, "undecodable document");
            let record = match document.into_record(period, now) {
                Ok(record) => record,
                Err(err) => {
                    warn!(id = %deleted.id, error = %err, "deleting undecodable agent record");
                    doomed.push(deleted.id);
                    summary.deleted.push(deleted);
                    continue;
                }
            };

            self.place_recovered(record, &mut summary).await?;
            summary.recovered += 1;
            *summary.recovered_by.entry(source).or_default() += 1;
            info!(id = %deleted.id, period = %period, source = source.field_name(), "recovered agent period");
        }

        if !doomed.is_empty() {
            let removed = self.store.delete_agents(&doomed).await?;
            warn!(removed, "deleted agent records that could not be backfilled");
        }
        Ok(summary)
    }

    /// Assigns the recovered period, resolving a key collision in favour of the
    /// more recently updated record.
    async fn place_recovered(
        &self,
        record: AgentPeriodRecord,
        summary: &mut BackfillSummary,
    ) -> Result<(), SyncError> {
        match self.store.assign_period(record.clone()).await {
            Ok(()) => Ok(()),
            Err(StoreError::DuplicateKey(_)) => {
                summary.merged_conflicts += 1;
                let existing = self.store.find_agent(&record.key()).await?;
                match existing {
                    Some(existing) if existing.last_updated >= record.last_updated => {
                        info!(
                            agent_name = %record.agent_name,
                            period = %record.period,
                            "recovered record is older than the stored one; dropping it"
                        );
                        self.store.delete_agents(&[record.id]).await?;
                        summary.deleted.push(superseded_record(&record));
                        Ok(())
                    }
                    Some(existing) => {
                        info!(
                            agent_name = %record.agent_name,
                            period = %record.period,
                            "recovered record is newer than the stored one; replacing it"
                        );
                        self.store.delete_agents(&[existing.id]).await?;
                        summary.deleted.push(superseded_record(&existing));
                        self.store.assign_period(record).await?;
                        Ok(())
                    }
                    None => {
                        self.store.assign_period(record).await?;
                        Ok(())
                    }
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Collapses every `(agent_name, year, month)` group to its most recently updated
    /// record, then restores the uniqueness guarantee.
    pub async fn deduplicate_period_records(&self) -> Result<DedupeSummary, SyncError> {
        let records = self.store.all_agents().await?;
        let total_records = records.len();

        let mut groups: HashMap<AgentKey, Vec<AgentPeriodRecord>> = HashMap::new();
        for record in records {
            groups.entry(record.key()).or_default().push(record);
        }

        let unique_keys = groups.len();
        let mut doomed = Vec::new();
        let mut duplicate_groups = 0usize;
        for (key, mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            duplicate_groups += 1;
            group.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
            let dropped = group.split_off(1);
            info!(
                agent_name = %key.agent_name,
                period = %key.period,
                kept = %group[0].id,
                deleted = dropped.len(),
                "collapsing duplicate agent records"
            );
            doomed.extend(dropped.into_iter().map(|r| r.id));
        }

        let records_deleted = if doomed.is_empty() {
            0
        } else {
            self.store.delete_agents(&doomed).await?
        };

        let index_restored = match self.store.ensure_period_index().await {
            Ok(()) => true,
            Err(StoreError::DuplicateKey(detail)) => {
                warn!(detail = %detail, "period index could not be restored");
                false
            }
            Err(err) => return Err(err.into()),
        };

        Ok(DedupeSummary {
            total_records,
            unique_keys,
            duplicate_groups,
            records_deleted,
            index_restored,
        })
    }

    pub async fn migrate_to_monthly_schema(&self) -> Result<MigrationSummary, SyncError> {
        let backfill = self.backfill_missing_periods().await?;
        let dedupe = self.deduplicate_period_records().await?;
        info!(
            recovered = backfill.recovered,
            deleted_unresolved = backfill.deleted.len(),
            deleted_duplicates = dedupe.records_deleted,
            "migrated agent records to monthly schema"
        );
        Ok(MigrationSummary { backfill, dedupe })
    }

    /// Stores exported agent documents. Documents with a valid `year`/`month` become
    /// period records directly; the rest wait for `backfill_missing_periods`.
    pub async fn import_legacy_agents(
        &self,
        documents: Vec<Map<String, JsonValue>>,
    ) -> Result<LegacyImportSummary, SyncError> {
        let mut summary = LegacyImportSummary {
            received: documents.len(),
            ..Default::default()
        };
        let now = Utc::now();

        for document in documents {
            let Some(period) = json_period(document.get("year"), document.get("month")) else {
                self.store.insert_legacy_agent(document).await?;
                summary.pending_backfill += 1;
                continue;
            };

            let legacy = LegacyAgentRecord {
                id: Uuid::new_v4(),
                document,
            };
            if legacy.agent_name().is_none() {
                warn!("rejecting exported agent document without agent_name");
                summary.rejected += 1;
                continue;
            }

            let record = match legacy.into_record(period, now) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "rejecting undecodable exported agent document");
                    summary.rejected += 1;
                    continue;
                }
            };

            match self.store.insert_agent(record).await {
                Ok(()) => summary.imported += 1,
                Err(StoreError::DuplicateKey(detail)) => {
                    info!(detail = %detail, "exported agent document conflicts with stored record");
                    summary.conflicts += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(
            received = summary.received,
            imported = summary.imported,
            pending_backfill = summary.pending_backfill,
            conflicts = summary.conflicts,
            "imported legacy agent documents"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::basic_entry;
    use callrep_core::PeriodSource;
    use callrep_storage::{MemoryStore, ReportStore};
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn period(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("period")
    }

    fn doc(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().expect("object")
    }

    fn record(name: &str, period: Period, updated: DateTime<Utc>, total: &str) -> AgentPeriodRecord {
        AgentPeriodRecord {
            id: Uuid::new_v4(),
            agent_name: name.to_string(),
            agent_number: None,
            period,
            run_id: "legacy".to_string(),
            report_timestamp: None,
            last_updated: updated,
            incoming_calls: doc(json!({"total": total})),
            outgoing_calls: Map::new(),
            actions: String::new(),
            row_index: None,
            call_details: None,
        }
    }

    async fn agent_snapshot(store: &MemoryStore) -> Vec<(String, Period, String, JsonValue)> {
        let mut rows = store
            .all_agents()
            .await
            .expect("agents")
            .into_iter()
            .map(|r| {
                (
                    r.agent_name,
                    r.period,
                    r.run_id,
                    JsonValue::Object(r.incoming_calls),
                )
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        rows
    }

    #[tokio::test]
    async fn repair_run_restores_lost_upserts_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let service = ReportService::new(store.clone());
        let jan = period(2025, 1);

        // The raw report was stored but the process died before consolidation.
        store
            .insert_report(callrep_core::NewRawReport {
                id: Uuid::new_v4(),
                run_id: "task_20250115_090000".to_string(),
                saved_at: Utc::now(),
                period: jan,
                period_source: PeriodSource::Explicit,
                rows: vec![basic_entry(
                    "2024-06-01T00:00:00",
                    json!([
                        {"agent_name": "Ivanova", "incoming_calls": {"total": "5"}},
                        {"agent_name": "Petrov", "incoming_calls": {"total": "2"}},
                    ]),
                )],
            })
            .await
            .expect("insert report");

        let first = service.repair_run("task_20250115_090000").await.expect("repair");
        assert_eq!(first.agents_before, 0);
        assert_eq!(first.agents_after, 2);
        assert_eq!(first.agents_added, 2);
        assert_eq!(store.count_agents_in_period(jan).await.expect("count"), 2);
        let once = agent_snapshot(&store).await;

        let second = service.repair_run("task_20250115_090000").await.expect("repair again");
        assert_eq!(second.agents_before, 2);
        assert_eq!(second.agents_added, 0);
        assert_eq!(agent_snapshot(&store).await, once);
    }

    #[tokio::test]
    async fn repair_of_unknown_run_or_empty_period_is_not_found() {
        let service = ReportService::new(Arc::new(MemoryStore::new()));
        assert!(service.repair_run("task_missing").await.expect_err("missing").is_not_found());
        assert!(service.repair_period(2025, 1).await.expect_err("empty").is_not_found());
    }

    #[tokio::test]
    async fn repair_period_replays_oldest_first_so_latest_wins() {
        let store = Arc::new(MemoryStore::new());
        let service = ReportService::new(store.clone());
        for (run_id, total) in [("task_20250110_090000", "5"), ("task_20250120_090000", "9")] {
            service
                .save_report(
                    vec![basic_entry("2025-01-10T09:00:00", json!([{"agent_name": "Ivanova", "incoming_calls": {"total": total}}]))],
                    run_id,
                    Some(2025),
                    Some(1),
                )
                .await
                .expect("save");
        }

        // Clobber the record as if an out-of-order write had landed last.
        store
            .upsert_agent(record("Ivanova", period(2025, 1), Utc::now(), "1"))
            .await
            .expect("clobber");

        let summary = service.repair_period(2025, 1).await.expect("repair period");
        assert_eq!(summary.total_reports, 2);
        assert_eq!(summary.reports_processed, 2);
        assert_eq!(summary.report_details[0].run_id, "task_20250110_090000");

        let agents = service.get_agents_by_month(2025, 1).await.expect("agents");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].incoming_calls["total"], "9");
    }

    #[test]
    fn legacy_period_sources_follow_priority() {
        let all = doc(json!({
            "month_year": "2024-11",
            "period": {"year": 2024, "month": 10},
            "report_timestamp": "2024-09-01T00:00:00",
            "last_updated": "2024-08-01T00:00:00",
        }));
        assert_eq!(
            recover_period(&all),
            Some((period(2024, 11), LegacyPeriodSource::MonthYearField))
        );

        let broken_month_year = doc(json!({
            "month_year": "sometime",
            "period": {"year": "2024", "month": "10"},
        }));
        assert_eq!(
            recover_period(&broken_month_year),
            Some((period(2024, 10), LegacyPeriodSource::PeriodObject))
        );

        let mongo_dates = doc(json!({"last_updated": {"$date": "2024-08-15T00:00:00Z"}}));
        assert_eq!(
            recover_period(&mongo_dates),
            Some((period(2024, 8), LegacyPeriodSource::LastUpdated))
        );

        assert_eq!(recover_period(&doc(json!({"agent_name": "x"}))), None);
    }

    #[tokio::test]
    async fn backfill_recovers_or_deletes_every_periodless_record() {
        let store = Arc::new(MemoryStore::new());
        let service = ReportService::new(store.clone());

        store
            .insert_legacy_agent(doc(json!({"agent_name": "Ivanova", "month_year": "2024-11", "incoming_calls": {"total": "9"}})))
            .await
            .expect("legacy");
        store
            .insert_legacy_agent(doc(json!({"agent_name": "Petrov", "report_timestamp": "2024-12-03T08:00:00"})))
            .await
            .expect("legacy");
        let orphan = store
            .insert_legacy_agent(doc(json!({"agent_name": "Stoyanov", "agent_number": "104"})))
            .await
            .expect("legacy");

        let summary = service.backfill_missing_periods().await.expect("backfill");
        assert_eq!(summary.inspected, 3);
        assert_eq!(summary.recovered, 2);
        assert_eq!(summary.recovered_by[&LegacyPeriodSource::MonthYearField], 1);
        assert_eq!(summary.recovered_by[&LegacyPeriodSource::ReportTimestamp], 1);
        assert_eq!(summary.deleted.len(), 1);
        assert_eq!(summary.deleted[0].id, orphan);
        assert_eq!(summary.deleted[0].agent_number.as_deref(), Some("104"));

        assert!(store.legacy_agents().await.expect("legacy").is_empty());
        assert_eq!(store.agent_document_count().await, 2);
        let ivanova = service
            .get_agent_by_name_and_month("Ivanova", 2024, 11)
            .await
            .expect("lookup")
            .expect("recovered");
        assert_eq!(ivanova.incoming_calls["total"], "9");

        let again = service.backfill_missing_periods().await.expect("second backfill");
        assert_eq!(again, BackfillSummary::default());
    }

    #[tokio::test]
    async fn backfill_conflicts_keep_the_newer_record() {
        let store = Arc::new(MemoryStore::new());
        let service = ReportService::new(store.clone());
        let nov = period(2024, 11);
        let now = Utc::now();

        let stored = record("Ivanova", nov, now - Duration::days(1), "stored");
        let stored_id = stored.id;
        store.upsert_agent(stored).await.expect("stored");
        store
            .insert_legacy_agent(doc(json!({
                "agent_name": "Ivanova",
                "month_year": "2024-11",
                "incoming_calls": {"total": "legacy-newer"},
                "last_updated": now.to_rfc3339(),
            })))
            .await
            .expect("legacy");
        let older_id = store
            .insert_legacy_agent(doc(json!({
                "agent_name": "Ivanova",
                "month_year": "2024-11",
                "incoming_calls": {"total": "legacy-older"},
                "last_updated": (now - Duration::days(30)).to_rfc3339(),
            })))
            .await
            .expect("legacy");

        let summary = service.backfill_missing_periods().await.expect("backfill");
        assert_eq!(summary.merged_conflicts, 2);
        assert_eq!(store.count_agents_in_period(nov).await.expect("count"), 1);
        assert_eq!(store.agent_document_count().await, 1);
        let mut superseded = summary.deleted.iter().map(|d| d.id).collect::<Vec<_>>();
        superseded.sort();
        let mut expected = vec![stored_id, older_id];
        expected.sort();
        assert_eq!(superseded, expected);
        assert!(summary
            .deleted
            .iter()
            .all(|d| d.reason == "superseded by newer record" && d.agent_name.as_deref() == Some("Ivanova")));
        let kept = service
            .get_agent_by_name_and_month("Ivanova", 2024, 11)
            .await
            .expect("lookup")
            .expect("kept");
        assert_eq!(kept.incoming_calls["total"], "legacy-newer");
    }

    #[tokio::test]
    async fn backfill_matches_names_with_stray_whitespace() {
        let store = Arc::new(MemoryStore::new());
        let service = ReportService::new(store.clone());
        let nov = period(2024, 11);

        service
            .save_report(
                vec![basic_entry("2024-11-05T09:00:00", json!([{"agent_name": "Ivanova", "incoming_calls": {"total": "4"}}]))],
                "task_20241105_090000",
                None,
                None,
            )
            .await
            .expect("save");
        store
            .insert_legacy_agent(doc(json!({"agent_name": "Ivanova ", "month_year": "2024-11"})))
            .await
            .expect("legacy");

        let summary = service.backfill_missing_periods().await.expect("backfill");
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.merged_conflicts, 1);
        assert_eq!(store.count_agents_in_period(nov).await.expect("count"), 1);
        assert_eq!(store.agent_document_count().await, 1);
        let names = service.get_all_agent_names().await.expect("names");
        assert_eq!(names, vec!["Ivanova".to_string()]);
    }

    #[tokio::test]
    async fn dedupe_keeps_latest_and_restores_uniqueness() {
        let store = Arc::new(MemoryStore::without_period_index());
        let service = ReportService::new(store.clone());
        let jan = period(2025, 1);
        let now = Utc::now();

        for (offset, total) in [(3, "old"), (1, "newest"), (2, "middle")] {
            store
                .insert_agent(record("Ivanova", jan, now - Duration::hours(offset), total))
                .await
                .expect("insert");
        }
        store
            .insert_agent(record("Petrov", jan, now, "only"))
            .await
            .expect("insert");

        let summary = service.deduplicate_period_records().await.expect("dedupe");
        assert_eq!(summary.total_records, 4);
        assert_eq!(summary.unique_keys, 2);
        assert_eq!(summary.duplicate_groups, 1);
        assert_eq!(summary.records_deleted, 2);
        assert!(summary.index_restored);
        assert!(store.has_period_index().await);
        assert_eq!(store.count_agents_in_period(jan).await.expect("count"), 2);

        let kept = service
            .get_agent_by_name_and_month("Ivanova", 2025, 1)
            .await
            .expect("lookup")
            .expect("kept");
        assert_eq!(kept.incoming_calls["total"], "newest");

        let again = service.deduplicate_period_records().await.expect("dedupe again");
        assert_eq!(again.records_deleted, 0);
        assert_eq!(again.duplicate_groups, 0);
    }

    #[tokio::test]
    async fn migration_runs_backfill_then_dedupe() {
        let store = Arc::new(MemoryStore::without_period_index());
        let service = ReportService::new(store.clone());
        let nov = period(2024, 11);
        let now = Utc::now();

        store
            .insert_agent(record("Ivanova", nov, now - Duration::days(2), "a"))
            .await
            .expect("insert");
        store
            .insert_agent(record("Ivanova", nov, now - Duration::days(1), "b"))
            .await
            .expect("insert");
        store
            .insert_legacy_agent(doc(json!({"agent_name": "Petrov", "period": {"year": 2024, "month": 11}})))
            .await
            .expect("legacy");
        store
            .insert_legacy_agent(doc(json!({"agent_name": "Ghost"})))
            .await
            .expect("legacy");

        let summary = service.migrate_to_monthly_schema().await.expect("migrate");
        assert_eq!(summary.backfill.recovered, 1);
        assert_eq!(summary.backfill.deleted.len(), 1);
        assert_eq!(summary.dedupe.records_deleted, 1);
        assert!(summary.dedupe.index_restored);
        assert_eq!(store.count_agents_in_period(nov).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn legacy_import_splits_dated_and_undated_documents() {
        let store = Arc::new(MemoryStore::new());
        let service = ReportService::new(store.clone());

        let summary = service
            .import_legacy_agents(vec![
                doc(json!({"agent_name": "Ivanova", "year": 2024, "month": 11, "task_id": "task_20241105_080000"})),
                doc(json!({"agent_name": "Ivanova", "year": "2024", "month": "11"})),
                doc(json!({"agent_name": "Petrov", "month_year": "2024-12"})),
                doc(json!({"year": 2024, "month": 10})),
            ])
            .await
            .expect("import");

        assert_eq!(summary.received, 4);
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.pending_backfill, 1);
        assert_eq!(summary.rejected, 1);

        let imported = service
            .get_agent_by_name_and_month("Ivanova", 2024, 11)
            .await
            .expect("lookup")
            .expect("imported");
        assert_eq!(imported.run_id, "task_20241105_080000");
        assert_eq!(store.legacy_agents().await.expect("legacy").len(), 1);
    }
}
