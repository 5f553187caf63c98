//! Monthly consolidation core: period resolution, per-agent upserts, latest-run reads,
//! repair and migration batches, and the background job runner.

mod consolidate;
mod jobs;
mod latest;
mod period;
mod queries;
mod repair;
mod service;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use callrep_adapters::{AdapterError, HttpExtractorConfig};
use callrep_core::Period;
use callrep_storage::{BasicAuth, HttpClientConfig, StoreError};
use thiserror::Error;

pub use consolidate::{AgentConsolidator, ConsolidationTally, PeriodMode};
pub use jobs::{maybe_build_scheduler, HistoricalTrigger, JobRunner};
pub use latest::MonthlyStatistics;
pub use period::{explicit_period, generate_run_id, resolve_period, resolve_period_at, run_id_date};
pub use queries::{MonthSummary, OverallStatistics};
pub use repair::{
    BackfillSummary, DedupeSummary, DeletedRecord, LegacyImportSummary, MigrationSummary,
    PeriodRepairSummary, RunRepairSummary,
};
pub use service::{ReportService, SaveOutcome};

pub const CRATE_NAME: &str = "callrep-sync";

pub const DEFAULT_HISTORICAL_MONTHS: usize = 12;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no raw report stored for run {0}")]
    RunNotFound(String),
    #[error("no raw reports stored for {0}")]
    NoReportsForPeriod(Period),
    #[error("invalid period {year}-{month}")]
    InvalidPeriod { year: i32, month: u32 },
    #[error("agent row rejected: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extract(#[from] AdapterError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors that mean "nothing to operate on" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::RunNotFound(_) | SyncError::NoReportsForPeriod(_)
        )
    }

    /// Store connection failures abort the batch in progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_unavailable())
    }
}

pub(crate) fn validated_period(year: i32, month: u32) -> Result<Period, SyncError> {
    Period::new(year, month).ok_or(SyncError::InvalidPeriod { year, month })
}

fn env_value(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env_value(lookup, key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub report_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: usize,
    pub historical_delay_secs: u64,
    pub historical_max_months: usize,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| env_value(&lookup, key);

        Self {
            database_url: non_empty("DATABASE_URL"),
            report_url: non_empty("CALLREP_REPORT_URL"),
            username: non_empty("CALLREP_USERNAME"),
            password: non_empty("CALLREP_PASSWORD"),
            user_agent: non_empty("CALLREP_USER_AGENT")
                .unwrap_or_else(|| "callrep-bot/0.1".to_string()),
            http_timeout_secs: env_parsed(&lookup, "CALLREP_HTTP_TIMEOUT_SECS").unwrap_or(20),
            max_pages: env_parsed(&lookup, "CALLREP_MAX_PAGES").unwrap_or(50),
            historical_delay_secs: env_parsed(&lookup, "CALLREP_HISTORICAL_DELAY_SECS").unwrap_or(5),
            historical_max_months: env_parsed(&lookup, "CALLREP_HISTORICAL_MAX_MONTHS").unwrap_or(24),
            archive_dir: non_empty("CALLREP_ARCHIVE_DIR").map(PathBuf::from),
            scheduler_enabled: lookup("CALLREP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: non_empty("CALLREP_SCRAPE_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            web_port: env_parsed(&lookup, "CALLREP_WEB_PORT").unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            basic_auth: self.username.clone().map(|username| BasicAuth {
                username,
                password: self.password.clone(),
            }),
            ..Default::default()
        }
    }

    pub fn extractor_config(&self) -> Option<HttpExtractorConfig> {
        self.report_url.clone().map(|report_url| HttpExtractorConfig {
            report_url,
            max_pages: self.max_pages,
            ..Default::default()
        })
    }

    pub fn historical_delay(&self) -> Duration {
        Duration::from_secs(self.historical_delay_secs)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use callrep_core::{RawAgentRow, ReportEntry};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    pub fn ts(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    pub fn row(name: &str, incoming_total: &str) -> RawAgentRow {
        serde_json::from_value(json!({
            "agent_name": name,
            "agent_number": "100",
            "incoming_calls": {"total": incoming_total},
            "outgoing_calls": {"total": "0"},
        }))
        .expect("row")
    }

    pub fn basic_entry(timestamp: &str, rows: serde_json::Value) -> ReportEntry {
        ReportEntry(json!({
            "timestamp": timestamp,
            "all_agents": rows,
        }))
    }
}
