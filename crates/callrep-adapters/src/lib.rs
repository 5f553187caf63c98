//! Report extractor contracts, the agent report table parser and the concrete extractors.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use callrep_core::{Period, RawAgentRow, ReportEntry};
use callrep_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "callrep-adapters";

const INCOMING_COLUMNS: [&str; 10] = [
    "total",
    "unsuccessful",
    "successful",
    "min_time",
    "max_time",
    "avg_time",
    "total_time",
    "min_wait",
    "max_wait",
    "avg_wait",
];

const OUTGOING_COLUMNS: [&str; 7] = [
    "total",
    "unsuccessful",
    "successful",
    "min_time",
    "max_time",
    "avg_time",
    "total_time",
];

const ACTIONS_COLUMN: usize = 2 + INCOMING_COLUMNS.len() + OUTGOING_COLUMNS.len();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractContext {
    pub run_id: String,
    /// Month the run was asked to cover; `None` means "whatever the page shows now".
    pub target_period: Option<Period>,
    pub started_at: DateTime<Utc>,
}

impl ExtractContext {
    pub fn new(run_id: impl Into<String>, target_period: Option<Period>) -> Self {
        Self {
            run_id: run_id.into(),
            target_period,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("report table not found at {0}")]
    NoTable(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces the payload of one scrape run: an ordered list of report entries.
#[async_trait]
pub trait ReportExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<ReportEntry>, AdapterError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total_pages: Option<usize>,
    pub current_page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedReportPage {
    pub headers: Vec<String>,
    pub rows: Vec<RawAgentRow>,
    pub pagination: Pagination,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn normalize_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Header text without the sort indicator spans.
fn header_text(th: ElementRef<'_>) -> String {
    let parts = th.descendants().filter_map(|node| {
        let text = match node.value() {
            Node::Text(text) => &**text,
            _ => return None,
        };
        let inside_span = node
            .ancestors()
            .take_while(|ancestor| ancestor.id() != th.id())
            .any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| el.name() == "span")
            });
        (!inside_span).then_some(text)
    });
    normalize_text(parts)
}

fn map_row(headers: &[String], row_index: usize, cells: &[String]) -> RawAgentRow {
    let mut row = RawAgentRow {
        row_index: i64::try_from(row_index).ok(),
        ..RawAgentRow::default()
    };

    for (index, cell) in cells.iter().enumerate() {
        match index {
            0 => row.agent_number = text_or_none(cell.clone()),
            1 => row.agent_name = text_or_none(cell.clone()),
            i if (2..2 + INCOMING_COLUMNS.len()).contains(&i) => {
                row.incoming_calls.insert(
                    INCOMING_COLUMNS[i - 2].to_string(),
                    JsonValue::String(cell.clone()),
                );
            }
            i if (2 + INCOMING_COLUMNS.len()..ACTIONS_COLUMN).contains(&i) => {
                row.outgoing_calls.insert(
                    OUTGOING_COLUMNS[i - 2 - INCOMING_COLUMNS.len()].to_string(),
                    JsonValue::String(cell.clone()),
                );
            }
            ACTIONS_COLUMN => row.actions = cell.clone(),
            _ => {}
        }

        let header = headers
            .get(index)
            .filter(|h| !h.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("column_{index}"));
        row.extra
            .insert(format!("raw_{header}"), JsonValue::String(cell.clone()));
    }

    row
}

/// Parses one agent report page. `Ok(None)` means the page carries no report table
/// (a login page, an error page, or a layout change).
pub fn parse_report_page(html: &str) -> Result<Option<ParsedReportPage>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table.blueTable")?;
    let Some(table) = document.select(&table_sel).next() else {
        return Ok(None);
    };

    let header_row_sel = selector("thead tr")?;
    let Some(header_row) = table.select(&header_row_sel).next() else {
        return Ok(None);
    };
    let th_sel = selector("th")?;
    let headers = header_row.select(&th_sel).map(header_text).collect::<Vec<_>>();

    let row_sel = selector("tbody tr.edit_rows")?;
    let td_sel = selector("td")?;
    let rows = table
        .select(&row_sel)
        .enumerate()
        .map(|(row_index, tr)| {
            let cells = tr
                .select(&td_sel)
                .map(|td| normalize_text(td.text()))
                .collect::<Vec<_>>();
            map_row(&headers, row_index, &cells)
        })
        .collect::<Vec<_>>();

    let link_sel = selector("tfoot a")?;
    let active_sel = selector("tfoot a.active")?;
    let link_count = table.select(&link_sel).count();
    let pagination = Pagination {
        total_pages: (link_count > 0).then_some(link_count),
        current_page: table
            .select(&active_sel)
            .next()
            .and_then(|a| text_or_none(normalize_text(a.text()))),
    };

    Ok(Some(ParsedReportPage {
        headers,
        rows,
        pagination,
    }))
}

/// Query parameters for one page of the report, constrained to a month when targeted.
pub fn page_query(page: usize, target: Option<Period>) -> Vec<(String, String)> {
    let mut query = vec![("page".to_string(), page.to_string())];
    if let Some(period) = target {
        if let (Some(first), Some(last)) = (period.first_day(), period.last_day()) {
            query.push(("date_from".to_string(), first.format("%Y-%m-%d").to_string()));
            query.push(("date_to".to_string(), last.format("%Y-%m-%d").to_string()));
        }
    }
    query
}

#[derive(Debug, Clone)]
pub struct HttpExtractorConfig {
    pub report_url: String,
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for HttpExtractorConfig {
    fn default() -> Self {
        Self {
            report_url: String::new(),
            max_pages: 50,
            page_delay: Duration::from_secs(1),
        }
    }
}

/// Walks the paginated agent report over HTTP and folds every page into one basic entry.
#[derive(Debug)]
pub struct HttpReportExtractor {
    fetcher: HttpFetcher,
    config: HttpExtractorConfig,
}

impl HttpReportExtractor {
    pub fn new(fetcher: HttpFetcher, config: HttpExtractorConfig) -> Self {
        Self { fetcher, config }
    }
}

#[async_trait]
impl ReportExtractor for HttpReportExtractor {
    fn name(&self) -> &'static str {
        "http_agent_report"
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<ReportEntry>, AdapterError> {
        let url = self.config.report_url.as_str();
        let mut all_rows = Vec::new();
        let mut total_pages = 1usize;
        let mut page = 1usize;
        let mut failure: Option<String> = None;

        while page <= total_pages && page <= self.config.max_pages.max(1) {
            let query = page_query(page, ctx.target_period);
            let fetched = match self.fetcher.fetch_text(&ctx.run_id, url, &query).await {
                Ok(fetched) => fetched,
                Err(err) if page == 1 => return Err(err.into()),
                Err(err) => {
                    warn!(run_id = %ctx.run_id, page, error = %err, "stopping pagination after fetch failure");
                    failure = Some(err.to_string());
                    break;
                }
            };

            let Some(parsed) = parse_report_page(&fetched.body)? else {
                if page == 1 {
                    return Err(AdapterError::NoTable(fetched.final_url));
                }
                warn!(run_id = %ctx.run_id, page, "report table missing on follow-up page");
                failure = Some(format!("report table missing on page {page}"));
                break;
            };

            debug!(run_id = %ctx.run_id, page, rows = parsed.rows.len(), "parsed report page");
            if let Some(pages) = parsed.pagination.total_pages {
                total_pages = pages;
            }
            all_rows.extend(parsed.rows);
            page += 1;

            if page <= total_pages && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        if total_pages > self.config.max_pages && failure.is_none() {
            warn!(
                run_id = %ctx.run_id,
                total_pages,
                max_pages = self.config.max_pages,
                "report has more pages than configured maximum"
            );
        }

        let pages_processed = page - 1;
        let mut entry = ReportEntry::basic(Utc::now(), &all_rows, pages_processed);
        if let Some(object) = entry.0.as_object_mut() {
            object.insert("url".to_string(), JsonValue::String(url.to_string()));
            object.insert(
                "page_type".to_string(),
                JsonValue::String("detailed_agent_report_complete".to_string()),
            );
            if let Some(error) = failure {
                object.insert("extraction_complete".to_string(), JsonValue::Bool(false));
                object.insert("error".to_string(), JsonValue::String(error));
            }
        }

        info!(
            run_id = %ctx.run_id,
            agents = all_rows.len(),
            pages_processed,
            "extracted agent report"
        );
        Ok(vec![entry])
    }
}

/// Replays a payload captured earlier (exports, archived runs, test fixtures).
#[derive(Debug, Clone)]
pub struct FixtureExtractor {
    path: PathBuf,
}

impl FixtureExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReportExtractor for FixtureExtractor {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<ReportEntry>, AdapterError> {
        let entries = load_payload_file(&self.path)?;
        debug!(run_id = %ctx.run_id, path = %self.path.display(), entries = entries.len(), "loaded payload fixture");
        Ok(entries)
    }
}

/// Reads a run payload: an array of entries, an object wrapping them under `reports`
/// or `rows`, or a single entry object.
pub fn load_payload_file(path: &Path) -> Result<Vec<ReportEntry>, AdapterError> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading payload file {}", path.display()))?;
    let value: JsonValue = serde_json::from_str(&text)
        .with_context(|| format!("parsing payload file {}", path.display()))?;
    payload_entries(value).ok_or_else(|| {
        AdapterError::Message(format!(
            "{} is not a report payload (expected an array or an object with reports/rows)",
            path.display()
        ))
    })
}

fn payload_entries(value: JsonValue) -> Option<Vec<ReportEntry>> {
    match value {
        JsonValue::Array(items) => Some(items.into_iter().map(ReportEntry).collect()),
        JsonValue::Object(mut object) => {
            for key in ["reports", "rows"] {
                if let Some(JsonValue::Array(items)) = object.remove(key) {
                    return Some(items.into_iter().map(ReportEntry).collect());
                }
            }
            if object.contains_key("all_agents") || object.contains_key("agent_data") {
                return Some(vec![ReportEntry(JsonValue::Object(object))]);
            }
            None
        }
        _ => None,
    }
}

/// Reads exported agent documents for legacy import: an array, or an object with `agents`.
pub fn load_agent_documents(path: &Path) -> Result<Vec<Map<String, JsonValue>>, AdapterError> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading agent export {}", path.display()))?;
    let value: JsonValue = serde_json::from_str(&text)
        .with_context(|| format!("parsing agent export {}", path.display()))?;

    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut object) => match object.remove("agents") {
            Some(JsonValue::Array(items)) => items,
            _ => {
                return Err(AdapterError::Message(format!(
                    "{} has no agents array",
                    path.display()
                )))
            }
        },
        _ => {
            return Err(AdapterError::Message(format!(
                "{} is not an agent export",
                path.display()
            )))
        }
    };

    let mut documents = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match item {
            JsonValue::Object(document) => documents.push(document),
            other => warn!(index, kind = %json_kind(&other), "skipping non-object agent document"),
        }
    }
    Ok(documents)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
