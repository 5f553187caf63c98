//! Document store seam, store backends, payload archive and HTTP fetch utilities.

mod archive;
mod http;
mod memory;
mod postgres;

use async_trait::async_trait;
use callrep_core::{
    AgentKey, AgentPeriodRecord, JobRecord, LegacyAgentRecord, NewRawReport, Period, RawReport,
    ReportSummary,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub use archive::{ArchivedRun, PayloadArchive};
pub use http::{
    classify_page_status, BasicAuth, FetchError, FetchedPage, HttpClientConfig, HttpFetcher,
    PageFailure, PageRetry,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "callrep-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Connection-level failures are fatal for the operation in progress.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Document counts across the agent collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentTotals {
    /// Records that carry a period.
    pub records: usize,
    pub unique_names: usize,
    pub legacy: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// The two logical collections (raw reports, agent-period records) plus the job table.
///
/// Implementations must provide per-document atomicity for `upsert_agent`;
/// when the period index is in place no two agent records share an [`AgentKey`].
#[async_trait]
pub trait ReportStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Appends a raw report, assigning its save sequence. Fails with
    /// [`StoreError::DuplicateKey`] when the run id already exists.
    async fn insert_report(&self, report: NewRawReport) -> Result<RawReport, StoreError>;

    async fn report_by_run_id(&self, run_id: &str) -> Result<Option<RawReport>, StoreError>;

    /// Every report of a period, oldest first by `(saved_at, seq)`.
    async fn reports_for_period(&self, period: Period) -> Result<Vec<RawReport>, StoreError>;

    /// Summaries of every stored report, newest first by `(saved_at, seq)`.
    async fn report_summaries(&self) -> Result<Vec<ReportSummary>, StoreError>;

    /// Replace-on-conflict write keyed on `(agent_name, year, month)`. An existing
    /// record keeps its id; every other field is overwritten.
    async fn upsert_agent(&self, record: AgentPeriodRecord) -> Result<UpsertOutcome, StoreError>;

    /// Plain insert that honours the period index when it is in place.
    async fn insert_agent(&self, record: AgentPeriodRecord) -> Result<(), StoreError>;

    async fn find_agent(&self, key: &AgentKey) -> Result<Option<AgentPeriodRecord>, StoreError>;

    /// Records of a period sorted by agent name, optionally restricted to one writer run.
    async fn agents_for_period(
        &self,
        period: Period,
        run_id: Option<&str>,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError>;

    async fn all_agents(&self) -> Result<Vec<AgentPeriodRecord>, StoreError>;

    /// Records whose name contains `fragment` ignoring case, newest `last_updated` first.
    async fn search_agents(&self, fragment: &str, limit: usize)
        -> Result<Vec<AgentPeriodRecord>, StoreError>;

    /// Most recently updated record whose name equals `name` ignoring case.
    async fn latest_agent_named(&self, name: &str) -> Result<Option<AgentPeriodRecord>, StoreError>;

    /// Distinct names of period records, in byte order.
    async fn agent_names(&self) -> Result<Vec<String>, StoreError>;

    /// Records whose numeric incoming total is at least `min_calls`, busiest first.
    /// Non-numeric totals never match.
    async fn agents_with_incoming_at_least(
        &self,
        min_calls: f64,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError>;

    async fn agent_totals(&self) -> Result<AgentTotals, StoreError>;

    async fn count_agents_written_by(&self, run_id: &str) -> Result<usize, StoreError>;

    async fn count_agents_in_period(&self, period: Period) -> Result<usize, StoreError>;

    /// Agent documents without a usable `(year, month)`.
    async fn legacy_agents(&self) -> Result<Vec<LegacyAgentRecord>, StoreError>;

    async fn insert_legacy_agent(&self, document: Map<String, JsonValue>) -> Result<Uuid, StoreError>;

    /// Replaces the document with id `record.id` by `record`, giving it a period.
    async fn assign_period(&self, record: AgentPeriodRecord) -> Result<(), StoreError>;

    async fn delete_agents(&self, ids: &[Uuid]) -> Result<usize, StoreError>;

    /// Establishes uniqueness on `(agent_name, year, month)`. Fails with
    /// [`StoreError::DuplicateKey`] while duplicates remain.
    async fn ensure_period_index(&self) -> Result<(), StoreError>;

    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn job(&self, run_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError>;
}
