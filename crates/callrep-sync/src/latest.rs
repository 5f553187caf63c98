use callrep_core::{AgentPeriodRecord, Period, RawReport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::service::ReportService;
use crate::{validated_period, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyStatistics {
    pub year: i32,
    pub month: u32,
    pub month_name: String,
    pub month_year: String,
    pub latest_run_id: Option<String>,
    /// Agents visible through the latest run.
    pub total_agents: usize,
    /// Every record stored for the period, whichever run wrote it.
    pub total_records: usize,
    pub total_reports: usize,
    pub total_incoming_calls: f64,
    pub total_outgoing_calls: f64,
    pub total_calls: f64,
    pub agents_with_calls: usize,
    pub average_calls_per_agent: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Authoritative report of a period: maximum `(saved_at, seq)`.
pub(crate) fn latest_of(reports: &[RawReport]) -> Option<&RawReport> {
    reports.iter().max_by_key(|r| r.recency())
}

impl ReportService {
    /// Run id of the most recently saved report of the period, if any.
    pub async fn select_latest_run(&self, year: i32, month: u32) -> Result<Option<String>, SyncError> {
        let period = validated_period(year, month)?;
        self.latest_run_for(period).await
    }

    pub(crate) async fn latest_run_for(&self, period: Period) -> Result<Option<String>, SyncError> {
        let reports = self.store.reports_for_period(period).await?;
        Ok(latest_of(&reports).map(|r| r.run_id.clone()))
    }

    /// Agents of a period as written by the period's latest run, sorted by name.
    /// A period without reports yields an empty list.
    pub async fn get_agents_by_month(
        &self,
        year: i32,
        month: u32,
    ) -> Result<Vec<AgentPeriodRecord>, SyncError> {
        let period = validated_period(year, month)?;
        let Some(latest) = self.latest_run_for(period).await? else {
            debug!(period = %period, "no reports for period");
            return Ok(Vec::new());
        };

        let agents = self.store.agents_for_period(period, Some(latest.as_str())).await?;
        info!(period = %period, run_id = %latest, agents = agents.len(), "read agents from latest run");
        Ok(agents)
    }

    pub async fn get_monthly_statistics(
        &self,
        year: i32,
        month: u32,
    ) -> Result<MonthlyStatistics, SyncError> {
        let period = validated_period(year, month)?;
        let reports = self.store.reports_for_period(period).await?;
        let latest_run_id = latest_of(&reports).map(|r| r.run_id.clone());

        let agents = match &latest_run_id {
            Some(run_id) => self.store.agents_for_period(period, Some(run_id.as_str())).await?,
            None => Vec::new(),
        };
        let total_records = self.store.count_agents_in_period(period).await?;

        let mut total_incoming_calls = 0.0;
        let mut total_outgoing_calls = 0.0;
        let mut agents_with_calls = 0usize;
        for agent in &agents {
            let incoming = agent.incoming_total().unwrap_or(0.0);
            let outgoing = agent.outgoing_total().unwrap_or(0.0);
            total_incoming_calls += incoming;
            total_outgoing_calls += outgoing;
            if incoming > 0.0 || outgoing > 0.0 {
                agents_with_calls += 1;
            }
        }
        let total_calls = total_incoming_calls + total_outgoing_calls;
        let average_calls_per_agent = if agents_with_calls > 0 {
            round2(total_calls / agents_with_calls as f64)
        } else {
            0.0
        };

        Ok(MonthlyStatistics {
            year: period.year,
            month: period.month,
            month_name: period.month_name().to_string(),
            month_year: period.month_year(),
            latest_run_id,
            total_agents: agents.len(),
            total_records,
            total_reports: reports.len(),
            total_incoming_calls,
            total_outgoing_calls,
            total_calls,
            agents_with_calls,
            average_calls_per_agent,
        })
    }
}
