use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callrep_adapters::{ExtractContext, ReportExtractor};
use callrep_core::{JobRecord, JobStatus, Period};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

use crate::period::generate_run_id;
use crate::service::ReportService;
use crate::{SyncConfig, SyncError, DEFAULT_HISTORICAL_MONTHS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalTrigger {
    pub months_back: usize,
    pub jobs: Vec<JobRecord>,
}

/// Runs scrape-and-save jobs in the background and records their progress.
#[derive(Clone)]
pub struct JobRunner {
    service: ReportService,
    extractor: Arc<dyn ReportExtractor>,
    historical_delay: Duration,
    historical_max_months: usize,
}

impl JobRunner {
    pub fn new(service: ReportService, extractor: Arc<dyn ReportExtractor>) -> Self {
        Self {
            service,
            extractor,
            historical_delay: Duration::from_secs(5),
            historical_max_months: 24,
        }
    }

    pub fn with_historical_limits(mut self, delay: Duration, max_months: usize) -> Self {
        self.historical_delay = delay;
        self.historical_max_months = max_months.max(1);
        self
    }

    pub fn configured(self, config: &SyncConfig) -> Self {
        self.with_historical_limits(config.historical_delay(), config.historical_max_months)
    }

    pub fn service(&self) -> &ReportService {
        &self.service
    }

    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }

    async fn enqueue(&self, target: Option<Period>) -> Result<JobRecord, SyncError> {
        let run_id = generate_run_id(Utc::now(), target);
        let message = match target {
            Some(period) => format!("queued scrape for {}", period.display_name()),
            None => "queued scrape".to_string(),
        };
        let job = JobRecord::queued(run_id, target, message);
        self.service.store().put_job(&job).await?;
        info!(run_id = %job.run_id, target = ?target.map(|p| p.month_year()), "job queued");
        Ok(job)
    }

    /// Queues a scrape and returns immediately; the job proceeds on the runtime.
    pub async fn trigger_scrape(&self, target: Option<Period>) -> Result<JobRecord, SyncError> {
        let job = self.enqueue(target).await?;
        let runner = self.clone();
        let queued = job.clone();
        let span = info_span!("scrape_job", run_id = %queued.run_id);
        tokio::spawn(
            async move {
                runner.execute(queued).await;
            }
            .instrument(span),
        );
        Ok(job)
    }

    /// Queues and runs a scrape to completion, returning its final state.
    pub async fn run_scrape(&self, target: Option<Period>) -> Result<JobRecord, SyncError> {
        let job = self.enqueue(target).await?;
        Ok(self.execute(job).await)
    }

    fn historical_range(&self, months_back: Option<usize>) -> usize {
        let requested = months_back.unwrap_or(DEFAULT_HISTORICAL_MONTHS);
        let months_back = requested.clamp(1, self.historical_max_months);
        if months_back != requested {
            warn!(requested, months_back, "historical range clamped");
        }
        months_back
    }

    async fn enqueue_historical(&self, months_back: usize) -> Result<Vec<JobRecord>, SyncError> {
        let mut jobs = Vec::with_capacity(months_back);
        for period in Period::current().walk_back(months_back) {
            jobs.push(self.enqueue(Some(period)).await?);
        }
        Ok(jobs)
    }

    /// Runs the historical jobs in the foreground, newest month first.
    pub async fn run_historical(&self, months_back: Option<usize>) -> Result<Vec<JobRecord>, SyncError> {
        let months_back = self.historical_range(months_back);
        let queued = self.enqueue_historical(months_back).await?;
        let mut finished = Vec::with_capacity(queued.len());
        for (index, job) in queued.into_iter().enumerate() {
            if index > 0 && !self.historical_delay.is_zero() {
                tokio::time::sleep(self.historical_delay).await;
            }
            finished.push(self.execute(job).await);
        }
        Ok(finished)
    }

    /// Queues one job per month walking back from the current one. The jobs run one
    /// after another, spaced by the historical delay.
    pub async fn trigger_historical(
        &self,
        months_back: Option<usize>,
    ) -> Result<HistoricalTrigger, SyncError> {
        let months_back = self.historical_range(months_back);
        let jobs = self.enqueue_historical(months_back).await?;

        let runner = self.clone();
        let queued = jobs.clone();
        let span = info_span!("historical_jobs", months_back);
        tokio::spawn(async move {
            let total = queued.len();
            for (index, job) in queued.into_iter().enumerate() {
                if index > 0 && !runner.historical_delay.is_zero() {
                    tokio::time::sleep(runner.historical_delay).await;
                }
                let finished = runner.execute(job).await;
                info!(
                    run_id = %finished.run_id,
                    position = index + 1,
                    total,
                    status = ?finished.status,
                    "historical job finished"
                );
            }
        }
        .instrument(span));

        Ok(HistoricalTrigger { months_back, jobs })
    }

    pub async fn job_status(&self, run_id: &str) -> Result<Option<JobRecord>, SyncError> {
        Ok(self.service.store().job(run_id).await?)
    }

    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, SyncError> {
        Ok(self.service.store().recent_jobs(limit).await?)
    }

    async fn record(&self, job: &JobRecord) {
        if let Err(err) = self.service.store().put_job(job).await {
            warn!(run_id = %job.run_id, error = %err, "job state could not be persisted");
        }
    }

    async fn execute(&self, mut job: JobRecord) -> JobRecord {
        match self.scrape_and_save(&mut job).await {
            Ok(()) => {
                info!(
                    run_id = %job.run_id,
                    data_count = job.data_count,
                    agents_saved = job.agents_saved,
                    "job completed"
                );
            }
            Err(err) => {
                error!(run_id = %job.run_id, extractor = self.extractor.name(), error = %err, "job failed");
                job.error = Some(err.to_string());
                let progress = job.progress;
                job.advance(JobStatus::Failed, progress, format!("failed: {err}"));
            }
        }
        self.record(&job).await;
        job
    }

    async fn scrape_and_save(&self, job: &mut JobRecord) -> Result<(), SyncError> {
        job.advance(JobStatus::Running, 10, "extracting report");
        self.record(job).await;

        let ctx = ExtractContext::new(job.run_id.clone(), job.target_period);
        let entries = self.extractor.extract(&ctx).await?;
        job.data_count = entries.len();
        if entries.is_empty() {
            job.advance(JobStatus::Completed, 100, "no data found");
            return Ok(());
        }

        job.advance(JobStatus::Running, 60, format!("saving {} entries", entries.len()));
        self.record(job).await;

        let (year, month) = match job.target_period {
            Some(period) => (Some(period.year), Some(period.month)),
            None => (None, None),
        };
        let outcome = self
            .service
            .save_report(entries, &job.run_id, year, month)
            .await?;

        job.report_id = Some(outcome.report_id);
        job.agents_saved = outcome.agents_saved;
        job.agents_failed = outcome.agents_failed;
        job.advance(
            JobStatus::Completed,
            100,
            format!(
                "saved {} agents for {}",
                outcome.agents_saved,
                outcome.period.display_name()
            ),
        );
        Ok(())
    }
}

/// Scheduler that triggers a current-month scrape on the configured cron, when enabled.
pub async fn maybe_build_scheduler(runner: JobRunner, config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scrape_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            match runner.trigger_scrape(None).await {
                Ok(job) => info!(run_id = %job.run_id, "scheduled scrape queued"),
                Err(err) => error!(error = %err, "scheduled scrape could not be queued"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
