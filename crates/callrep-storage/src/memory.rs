use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use callrep_core::{
    AgentKey, AgentPeriodRecord, JobRecord, LegacyAgentRecord, NewRawReport, Period, RawReport,
    ReportSummary,
};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{AgentTotals, ReportStore, StoreError, UpsertOutcome};

#[derive(Debug, Clone)]
enum AgentDocument {
    Resolved(AgentPeriodRecord),
    Legacy(LegacyAgentRecord),
}

impl AgentDocument {
    fn id(&self) -> Uuid {
        match self {
            AgentDocument::Resolved(r) => r.id,
            AgentDocument::Legacy(l) => l.id,
        }
    }

    fn resolved(&self) -> Option<&AgentPeriodRecord> {
        match self {
            AgentDocument::Resolved(r) => Some(r),
            AgentDocument::Legacy(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    reports: Vec<RawReport>,
    next_seq: i64,
    agents: Vec<AgentDocument>,
    period_index: bool,
    jobs: BTreeMap<String, JobRecord>,
}

impl MemoryState {
    /// Most recently updated record under `key`; there can be several without the index.
    fn position_of_key(&self, key: &AgentKey) -> Option<usize> {
        self.agents
            .iter()
            .enumerate()
            .filter_map(|(idx, doc)| doc.resolved().map(|r| (idx, r)))
            .filter(|(_, r)| r.agent_name == key.agent_name && r.period == key.period)
            .max_by_key(|(_, r)| r.last_updated)
            .map(|(idx, _)| idx)
    }

    fn resolved(&self) -> impl Iterator<Item = &AgentPeriodRecord> {
        self.agents.iter().filter_map(AgentDocument::resolved)
    }

    fn key_taken_by_other(&self, key: &AgentKey, id: Uuid) -> bool {
        self.agents.iter().any(|doc| {
            doc.resolved()
                .map(|r| r.id != id && r.agent_name == key.agent_name && r.period == key.period)
                .unwrap_or(false)
        })
    }
}

/// In-process document store. Single-document operations are atomic under one lock.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                period_index: true,
                ..Default::default()
            }),
        }
    }

    /// A store whose agent collection has lost its uniqueness constraint, as after
    /// a schema change. Used to exercise deduplication.
    pub fn without_period_index() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn has_period_index(&self) -> bool {
        self.state.lock().await.period_index
    }

    pub async fn agent_document_count(&self) -> usize {
        self.state.lock().await.agents.len()
    }
}

fn sorted_by_recency(mut reports: Vec<RawReport>) -> Vec<RawReport> {
    reports.sort_by_key(RawReport::recency);
    reports
}

#[async_trait]
impl ReportStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert_report(&self, report: NewRawReport) -> Result<RawReport, StoreError> {
        let mut state = self.state.lock().await;
        if state.reports.iter().any(|r| r.run_id == report.run_id) {
            return Err(StoreError::DuplicateKey(format!("raw report {}", report.run_id)));
        }
        state.next_seq += 1;
        let stored = RawReport::from_new(report, state.next_seq);
        state.reports.push(stored.clone());
        Ok(stored)
    }

    async fn report_by_run_id(&self, run_id: &str) -> Result<Option<RawReport>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.reports.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn reports_for_period(&self, period: Period) -> Result<Vec<RawReport>, StoreError> {
        let state = self.state.lock().await;
        let matching = state
            .reports
            .iter()
            .filter(|r| r.period == period)
            .cloned()
            .collect();
        Ok(sorted_by_recency(matching))
    }

    async fn report_summaries(&self) -> Result<Vec<ReportSummary>, StoreError> {
        let state = self.state.lock().await;
        let mut reports = sorted_by_recency(state.reports.clone());
        reports.reverse();
        Ok(reports.iter().map(RawReport::summary).collect())
    }

    async fn upsert_agent(&self, record: AgentPeriodRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.position_of_key(&record.key()) {
            Some(idx) => {
                let existing_id = state.agents[idx].id();
                state.agents[idx] = AgentDocument::Resolved(AgentPeriodRecord {
                    id: existing_id,
                    ..record
                });
                Ok(UpsertOutcome::Replaced)
            }
            None => {
                state.agents.push(AgentDocument::Resolved(record));
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn insert_agent(&self, record: AgentPeriodRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.agents.iter().any(|d| d.id() == record.id) {
            return Err(StoreError::DuplicateKey(format!("agent document {}", record.id)));
        }
        if state.period_index && state.position_of_key(&record.key()).is_some() {
            return Err(StoreError::DuplicateKey(format!(
                "{} {}",
                record.agent_name, record.period
            )));
        }
        state.agents.push(AgentDocument::Resolved(record));
        Ok(())
    }

    async fn find_agent(&self, key: &AgentKey) -> Result<Option<AgentPeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .position_of_key(key)
            .and_then(|idx| state.agents[idx].resolved().cloned()))
    }

    async fn agents_for_period(
        &self,
        period: Period,
        run_id: Option<&str>,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .agents
            .iter()
            .filter_map(AgentDocument::resolved)
            .filter(|r| r.period == period)
            .filter(|r| run_id.map(|id| r.run_id == id).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        Ok(out)
    }

    async fn all_agents(&self) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .iter()
            .filter_map(AgentDocument::resolved)
            .cloned()
            .collect())
    }

    async fn search_agents(
        &self,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let needle = fragment.to_lowercase();
        let state = self.state.lock().await;
        let mut out = state
            .resolved()
            .filter(|r| r.agent_name.to_lowercase().contains(&needle))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        out.truncate(limit);
        Ok(out)
    }

    async fn latest_agent_named(&self, name: &str) -> Result<Option<AgentPeriodRecord>, StoreError> {
        let wanted = name.to_lowercase();
        let state = self.state.lock().await;
        Ok(state
            .resolved()
            .filter(|r| r.agent_name.to_lowercase() == wanted)
            .max_by_key(|r| r.last_updated)
            .cloned())
    }

    async fn agent_names(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let names = state
            .resolved()
            .map(|r| r.agent_name.clone())
            .collect::<BTreeSet<_>>();
        Ok(names.into_iter().collect())
    }

    async fn agents_with_incoming_at_least(
        &self,
        min_calls: f64,
    ) -> Result<Vec<AgentPeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut ranked = state
            .resolved()
            .filter_map(|r| r.incoming_total().map(|total| (total, r)))
            .filter(|(total, _)| *total >= min_calls)
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.last_updated.cmp(&a.1.last_updated)));
        Ok(ranked.into_iter().map(|(_, r)| r.clone()).collect())
    }

    async fn agent_totals(&self) -> Result<AgentTotals, StoreError> {
        let state = self.state.lock().await;
        let names = state
            .resolved()
            .map(|r| r.agent_name.as_str())
            .collect::<HashSet<_>>();
        Ok(AgentTotals {
            records: state.resolved().count(),
            unique_names: names.len(),
            legacy: state.agents.len() - state.resolved().count(),
        })
    }

    async fn count_agents_written_by(&self, run_id: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .iter()
            .filter_map(AgentDocument::resolved)
            .filter(|r| r.run_id == run_id)
            .count())
    }

    async fn count_agents_in_period(&self, period: Period) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .iter()
            .filter_map(AgentDocument::resolved)
            .filter(|r| r.period == period)
            .count())
    }

    async fn legacy_agents(&self) -> Result<Vec<LegacyAgentRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .iter()
            .filter_map(|doc| match doc {
                AgentDocument::Legacy(l) => Some(l.clone()),
                AgentDocument::Resolved(_) => None,
            })
            .collect())
    }

    async fn insert_legacy_agent(&self, document: Map<String, JsonValue>) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        state
            .agents
            .push(AgentDocument::Legacy(LegacyAgentRecord { id, document }));
        Ok(id)
    }

    async fn assign_period(&self, record: AgentPeriodRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.agents.iter().position(|d| d.id() == record.id) else {
            return Err(StoreError::NotFound(format!("agent document {}", record.id)));
        };
        if state.period_index && state.key_taken_by_other(&record.key(), record.id) {
            return Err(StoreError::DuplicateKey(format!(
                "{} {}",
                record.agent_name, record.period
            )));
        }
        state.agents[idx] = AgentDocument::Resolved(record);
        Ok(())
    }

    async fn delete_agents(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let ids: HashSet<Uuid> = ids.iter().copied().collect();
        let before = state.agents.len();
        state.agents.retain(|doc| !ids.contains(&doc.id()));
        Ok(before - state.agents.len())
    }

    async fn ensure_period_index(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut seen = HashSet::new();
        for record in state.agents.iter().filter_map(AgentDocument::resolved) {
            if !seen.insert(record.key()) {
                return Err(StoreError::DuplicateKey(format!(
                    "{} {}",
                    record.agent_name, record.period
                )));
            }
        }
        state.period_index = true;
        Ok(())
    }

    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.run_id.clone(), job.clone());
        Ok(())
    }

    async fn job(&self, run_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(run_id).cloned())
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs = state.jobs.values().cloned().collect::<Vec<_>>();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}
