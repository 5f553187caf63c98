use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use callrep_adapters::{
    load_agent_documents, load_payload_file, FixtureExtractor, HttpReportExtractor, ReportExtractor,
};
use callrep_core::Period;
use callrep_storage::{HttpFetcher, MemoryStore, PayloadArchive, PgStore, ReportStore};
use callrep_sync::{generate_run_id, maybe_build_scheduler, JobRunner, ReportService, SyncConfig};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "callrep-cli")]
#[command(about = "Call-center agent report scraper and monthly consolidator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API (and the scrape scheduler when enabled).
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Payload replayed when no report URL is configured.
        #[arg(long, default_value = "fixtures/agent_report/basic_run.json")]
        fixture: PathBuf,
    },
    /// Scrape once and save, optionally targeting a month.
    Scrape {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long, default_value = "fixtures/agent_report/basic_run.json")]
        fixture: PathBuf,
    },
    /// Scrape the last N months one after another.
    Historical {
        #[arg(long)]
        months_back: Option<usize>,
        #[arg(long, default_value = "fixtures/agent_report/basic_run.json")]
        fixture: PathBuf,
    },
    /// Save a captured run payload from a JSON file.
    Ingest {
        path: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
    },
    /// Load exported agent documents, with or without a period.
    ImportLegacy { path: PathBuf },
    /// Apply database migrations.
    Migrate,
    RepairRun { run_id: String },
    RepairPeriod { year: i32, month: u32 },
    Backfill,
    Dedupe,
    /// Backfill missing periods, then collapse duplicates.
    MigrateSchema,
    Months,
    Agents { year: i32, month: u32 },
    /// Monthly statistics, or overall statistics without a period.
    Stats { year: Option<i32>, month: Option<u32> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("callrep=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Months) {
        Commands::Serve { port, fixture } => {
            let service = build_service(&config).await?;
            let runner = JobRunner::new(service, build_extractor(&config, fixture)?).configured(&config);
            let scheduler = maybe_build_scheduler(runner.clone(), &config).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.scrape_cron, "scrape scheduler started");
            }
            callrep_web::serve(callrep_web::AppState::new(runner), port.unwrap_or(config.web_port)).await?;
        }
        Commands::Scrape { year, month, fixture } => {
            let target = target_period(year, month)?;
            let service = build_service(&config).await?;
            let runner = JobRunner::new(service, build_extractor(&config, fixture)?).configured(&config);
            print_json(&runner.run_scrape(target).await?)?;
        }
        Commands::Historical { months_back, fixture } => {
            let service = build_service(&config).await?;
            let runner = JobRunner::new(service, build_extractor(&config, fixture)?).configured(&config);
            print_json(&runner.run_historical(months_back).await?)?;
        }
        Commands::Ingest {
            path,
            run_id,
            year,
            month,
        } => {
            let entries = load_payload_file(&path)
                .with_context(|| format!("loading payload {}", path.display()))?;
            let run_id = run_id.unwrap_or_else(|| generate_run_id(Utc::now(), None));
            let service = build_service(&config).await?;
            print_json(&service.save_report(entries, &run_id, year, month).await?)?;
        }
        Commands::ImportLegacy { path } => {
            let documents = load_agent_documents(&path)
                .with_context(|| format!("loading agent export {}", path.display()))?;
            let service = build_service(&config).await?;
            print_json(&service.import_legacy_agents(documents).await?)?;
        }
        Commands::Migrate => {
            let Some(database_url) = &config.database_url else {
                bail!("DATABASE_URL is required for migrate");
            };
            let store = PgStore::connect(database_url, 1).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::RepairRun { run_id } => {
            let service = build_service(&config).await?;
            print_json(&service.repair_run(&run_id).await?)?;
        }
        Commands::RepairPeriod { year, month } => {
            let service = build_service(&config).await?;
            print_json(&service.repair_period(year, month).await?)?;
        }
        Commands::Backfill => {
            let service = build_service(&config).await?;
            print_json(&service.backfill_missing_periods().await?)?;
        }
        Commands::Dedupe => {
            let service = build_service(&config).await?;
            print_json(&service.deduplicate_period_records().await?)?;
        }
        Commands::MigrateSchema => {
            let service = build_service(&config).await?;
            print_json(&service.migrate_to_monthly_schema().await?)?;
        }
        Commands::Months => {
            let service = build_service(&config).await?;
            for month in service.get_available_months().await? {
                println!(
                    "{} {:<15} reports={} last={}",
                    month.month_year,
                    format!("{} {}", month.month_name, month.year),
                    month.report_count,
                    month.last_report.to_rfc3339()
                );
            }
        }
        Commands::Agents { year, month } => {
            let service = build_service(&config).await?;
            let agents = service.get_agents_by_month(year, month).await?;
            for agent in &agents {
                println!(
                    "{:<30} in={:<6} out={:<6} run={}",
                    agent.agent_name,
                    agent.incoming_total().map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    agent.outgoing_total().map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    agent.run_id
                );
            }
            println!("{} agents", agents.len());
        }
        Commands::Stats { year, month } => {
            let service = build_service(&config).await?;
            match target_period(year, month)? {
                Some(period) => {
                    print_json(&service.get_monthly_statistics(period.year, period.month).await?)?
                }
                None => print_json(&service.get_overall_statistics().await?)?,
            }
        }
    }

    Ok(())
}

async fn build_store(config: &SyncConfig) -> Result<Arc<dyn ReportStore>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PgStore::connect(url, 5).await?)),
        None => {
            warn!("DATABASE_URL not set; using in-memory store, nothing will persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_service(config: &SyncConfig) -> Result<ReportService> {
    let service = ReportService::new(build_store(config).await?);
    Ok(match &config.archive_dir {
        Some(dir) => service.with_archive(PayloadArchive::new(dir)),
        None => service,
    })
}

fn build_extractor(config: &SyncConfig, fixture: PathBuf) -> Result<Arc<dyn ReportExtractor>> {
    match config.extractor_config() {
        Some(extractor_config) => {
            let fetcher = HttpFetcher::new(config.http_client_config())?;
            Ok(Arc::new(HttpReportExtractor::new(fetcher, extractor_config)))
        }
        None => {
            warn!(path = %fixture.display(), "CALLREP_REPORT_URL not set; replaying fixture payload");
            Ok(Arc::new(FixtureExtractor::new(fixture)))
        }
    }
}

fn target_period(year: Option<i32>, month: Option<u32>) -> Result<Option<Period>> {
    match (year, month) {
        (None, None) => Ok(None),
        (Some(year), Some(month)) => Period::new(year, month)
            .map(Some)
            .with_context(|| format!("invalid period {year}-{month}")),
        _ => bail!("--year and --month must be given together"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("rendering output")?);
    Ok(())
}
