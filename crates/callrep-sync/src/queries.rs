use std::collections::{BTreeMap, BTreeSet};

use callrep_core::{AgentPeriodRecord, Period, RawReport, ReportSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::ReportService;
use crate::{validated_period, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthSummary {
    pub year: i32,
    pub month: u32,
    pub month_year: String,
    pub month_name: String,
    pub report_count: usize,
    pub first_report: DateTime<Utc>,
    pub last_report: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallStatistics {
    pub total_agents: usize,
    pub total_reports: usize,
    pub unique_agent_names: usize,
    pub months_covered: usize,
    pub legacy_records: usize,
    pub latest_report: Option<DateTime<Utc>>,
}

impl ReportService {
    pub async fn get_report_by_run_id(&self, run_id: &str) -> Result<Option<RawReport>, SyncError> {
        Ok(self.store.report_by_run_id(run_id).await?)
    }

    pub async fn get_recent_reports(&self, limit: usize) -> Result<Vec<ReportSummary>, SyncError> {
        let mut summaries = self.store.report_summaries().await?;
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Reports of one period, newest first.
    pub async fn get_reports_by_month(
        &self,
        year: i32,
        month: u32,
    ) -> Result<Vec<ReportSummary>, SyncError> {
        let period = validated_period(year, month)?;
        let mut reports = self.store.reports_for_period(period).await?;
        reports.reverse();
        Ok(reports.iter().map(RawReport::summary).collect())
    }

    /// Periods that have at least one stored report, newest period first.
    pub async fn get_available_months(&self) -> Result<Vec<MonthSummary>, SyncError> {
        let mut months: BTreeMap<Period, MonthSummary> = BTreeMap::new();
        for report in self.store.report_summaries().await? {
            let Some(period) = Period::new(report.year, report.month) else {
                continue;
            };
            months
                .entry(period)
                .and_modify(|summary| {
                    summary.report_count += 1;
                    summary.first_report = summary.first_report.min(report.saved_at);
                    summary.last_report = summary.last_report.max(report.saved_at);
                })
                .or_insert_with(|| MonthSummary {
                    year: period.year,
                    month: period.month,
                    month_year: period.month_year(),
                    month_name: period.month_name().to_string(),
                    report_count: 1,
                    first_report: report.saved_at,
                    last_report: report.saved_at,
                });
        }
        Ok(months.into_values().rev().collect())
    }

    /// Records whose agent name contains `fragment` (case-insensitive), newest first.
    pub async fn get_agent_history(
        &self,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<AgentPeriodRecord>, SyncError> {
        Ok(self.store.search_agents(fragment.trim(), limit).await?)
    }

    /// Most recently updated record of an agent, matched by exact name ignoring case.
    pub async fn get_agent_by_name(&self, name: &str) -> Result<Option<AgentPeriodRecord>, SyncError> {
        Ok(self.store.latest_agent_named(name.trim()).await?)
    }

    pub async fn get_agent_by_name_and_month(
        &self,
        name: &str,
        year: i32,
        month: u32,
    ) -> Result<Option<AgentPeriodRecord>, SyncError> {
        let period = validated_period(year, month)?;
        let wanted = name.trim().to_lowercase();
        Ok(self
            .store
            .agents_for_period(period, None)
            .await?
            .into_iter()
            .find(|r| r.agent_name.to_lowercase() == wanted))
    }

    pub async fn get_all_agent_names(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.store.agent_names().await?)
    }

    /// Records with a numeric incoming total of at least `min_calls`, busiest first.
    pub async fn search_agents_by_performance(
        &self,
        min_calls: f64,
    ) -> Result<Vec<AgentPeriodRecord>, SyncError> {
        Ok(self.store.agents_with_incoming_at_least(min_calls).await?)
    }

    pub async fn get_overall_statistics(&self) -> Result<OverallStatistics, SyncError> {
        let totals = self.store.agent_totals().await?;
        let reports = self.store.report_summaries().await?;
        let months_covered = reports
            .iter()
            .map(|r| (r.year, r.month))
            .collect::<BTreeSet<_>>()
            .len();

        Ok(OverallStatistics {
            total_agents: totals.records,
            total_reports: reports.len(),
            unique_agent_names: totals.unique_names,
            months_covered,
            legacy_records: totals.legacy,
            latest_report: reports.iter().map(|r| r.saved_at).max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::basic_entry;
    use callrep_storage::{MemoryStore, ReportStore};
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded() -> ReportService {
        let service = ReportService::new(Arc::new(MemoryStore::new()));
        let runs = [
            ("task_20241205_090000", 2024, 12, json!([
                {"agent_name": "Ivanova", "incoming_calls": {"total": "40"}},
                {"agent_name": "Petrov", "incoming_calls": {"total": "3"}},
            ])),
            ("task_20250110_090000", 2025, 1, json!([
                {"agent_name": "Ivanova", "incoming_calls": {"total": "12"}},
                {"agent_name": "Ivan Dimitrov", "incoming_calls": {"total": "n/a"}},
            ])),
            ("task_20250120_090000", 2025, 1, json!([
                {"agent_name": "Ivanova", "incoming_calls": {"total": "15"}},
            ])),
        ];
        for (run_id, year, month, rows) in runs {
            service
                .save_report(
                    vec![basic_entry("2025-01-01T00:00:00", rows)],
                    run_id,
                    Some(year),
                    Some(month),
                )
                .await
                .expect("seed");
        }
        service
    }

    #[tokio::test]
    async fn available_months_are_newest_first_with_counts() {
        let service = seeded().await;
        let months = service.get_available_months().await.expect("months");
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].month_year, "2025-01");
        assert_eq!(months[0].report_count, 2);
        assert_eq!(months[0].month_name, "January");
        assert!(months[0].first_report <= months[0].last_report);
        assert_eq!(months[1].month_year, "2024-12");
        assert_eq!(months[1].report_count, 1);
    }

    #[tokio::test]
    async fn reports_by_month_and_recent_reports_are_newest_first() {
        let service = seeded().await;
        let january = service.get_reports_by_month(2025, 1).await.expect("reports");
        assert_eq!(january.len(), 2);
        assert_eq!(january[0].run_id, "task_20250120_090000");

        let recent = service.get_recent_reports(2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "task_20250120_090000");

        let report = service
            .get_report_by_run_id("task_20241205_090000")
            .await
            .expect("lookup")
            .expect("report");
        assert_eq!(report.agent_row_count, 2);
    }

    #[tokio::test]
    async fn name_lookups_ignore_case() {
        let service = seeded().await;

        let history = service.get_agent_history("IVAN", 10).await.expect("history");
        assert_eq!(history.len(), 3, "Ivanova twice plus Ivan Dimitrov");
        assert!(history.windows(2).all(|w| w[0].last_updated >= w[1].last_updated));

        let latest = service.get_agent_by_name("ivanova").await.expect("by name").expect("record");
        assert_eq!(latest.period, Period::new(2025, 1).expect("period"));
        assert!(service.get_agent_by_name("ivan").await.expect("by name").is_none());

        let december = service
            .get_agent_by_name_and_month("PETROV", 2024, 12)
            .await
            .expect("by month")
            .expect("record");
        assert_eq!(december.incoming_calls["total"], "3");

        let names = service.get_all_agent_names().await.expect("names");
        assert_eq!(names, vec!["Ivan Dimitrov", "Ivanova", "Petrov"]);
    }

    #[tokio::test]
    async fn performance_search_skips_non_numeric_totals() {
        let service = seeded().await;
        let busy = service.search_agents_by_performance(10.0).await.expect("search");
        let totals = busy
            .iter()
            .map(|r| r.incoming_total().expect("numeric"))
            .collect::<Vec<_>>();
        assert_eq!(totals, vec![40.0, 15.0]);
    }

    #[tokio::test]
    async fn overall_statistics_cover_store_contents() {
        let service = seeded().await;
        service
            .store()
            .insert_legacy_agent(json!({"agent_name": "Stoyanov"}).as_object().cloned().expect("object"))
            .await
            .expect("legacy insert");

        let stats = service.get_overall_statistics().await.expect("stats");
        assert_eq!(stats.total_agents, 4);
        assert_eq!(stats.total_reports, 3);
        assert_eq!(stats.unique_agent_names, 3);
        assert_eq!(stats.months_covered, 2);
        assert_eq!(stats.legacy_records, 1);
        assert!(stats.latest_report.is_some());
    }
}
