//! Core domain model for call-center agent reports.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "callrep-core";

pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Calendar month used as the unit of organization and deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn from_date(date: &impl Datelike) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::from_date(&Utc::now())
    }

    /// Parses the legacy `"YYYY-MM"` form.
    pub fn parse_month_year(input: &str) -> Option<Self> {
        let (year, month) = input.trim().split_once('-')?;
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }

    pub fn month_year(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn month_name(&self) -> &'static str {
        MONTH_NAMES[(self.month as usize).clamp(1, 12) - 1]
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.month_name(), self.year)
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn last_day(&self) -> Option<NaiveDate> {
        let next = self.next();
        NaiveDate::from_ymd_opt(next.year, next.month, 1).map(|d| d - Duration::days(1))
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// This period followed by the `count - 1` periods before it, newest first.
    pub fn walk_back(&self, count: usize) -> Vec<Period> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = *self;
        for _ in 0..count {
            out.push(cursor);
            cursor = cursor.previous();
        }
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.month_year())
    }
}

/// Where a resolved period came from, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodSource {
    Explicit,
    RecordTimestamp,
    RunId,
    ProcessingTime,
}

impl PeriodSource {
    pub fn is_degraded(self) -> bool {
        matches!(self, PeriodSource::ProcessingTime)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeriodSource::Explicit => "explicit",
            PeriodSource::RecordTimestamp => "record_timestamp",
            PeriodSource::RunId => "run_id",
            PeriodSource::ProcessingTime => "processing_time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPeriod {
    pub period: Period,
    pub source: PeriodSource,
}

/// Alternate fields that older agent documents used to carry their period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyPeriodSource {
    MonthYearField,
    PeriodObject,
    ReportTimestamp,
    LastUpdated,
}

impl LegacyPeriodSource {
    pub const PRIORITY: [LegacyPeriodSource; 4] = [
        LegacyPeriodSource::MonthYearField,
        LegacyPeriodSource::PeriodObject,
        LegacyPeriodSource::ReportTimestamp,
        LegacyPeriodSource::LastUpdated,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            LegacyPeriodSource::MonthYearField => "month_year",
            LegacyPeriodSource::PeriodObject => "period",
            LegacyPeriodSource::ReportTimestamp => "report_timestamp",
            LegacyPeriodSource::LastUpdated => "last_updated",
        }
    }
}

/// Integer timestamps above this magnitude are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

fn epoch_timestamp(value: i64) -> Option<DateTime<FixedOffset>> {
    let utc = if value.unsigned_abs() > EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    };
    utc.map(|dt| dt.fixed_offset())
}

/// Timestamp as written, keeping any UTC offset it carried.
fn parse_timestamp_with_offset(value: &JsonValue) -> Option<DateTime<FixedOffset>> {
    match value {
        JsonValue::String(text) => parse_timestamp_str(text),
        JsonValue::Number(n) => n.as_i64().and_then(epoch_timestamp),
        JsonValue::Object(map) => match map.get("$date")? {
            JsonValue::Number(n) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(|dt| dt.fixed_offset()),
            JsonValue::String(text) => parse_timestamp_str(text),
            JsonValue::Object(inner) => inner
                .get("$numberLong")
                .and_then(JsonValue::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(|dt| dt.fixed_offset()),
            _ => None,
        },
        _ => None,
    }
}

/// Parses the timestamp shapes found in scraped payloads and stored documents:
/// RFC 3339 strings, naive ISO-8601 date-times or dates, Mongo extended JSON
/// `{"$date": ...}`, and integer epoch seconds or milliseconds.
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    parse_timestamp_with_offset(value).map(|dt| dt.with_timezone(&Utc))
}

/// Month a timestamp belongs to, read from its local wall-clock date. Values outside
/// the supported year range yield `None`.
pub fn timestamp_period(value: &JsonValue) -> Option<Period> {
    let local = parse_timestamp_with_offset(value)?.naive_local();
    Period::new(local.year(), local.month())
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some(naive.and_utc().fixed_offset())
}

/// Per-direction call aggregates as scraped (`total`, `successful`, `avg_time`, ...).
pub type CallAggregates = Map<String, JsonValue>;

/// Numeric value of an aggregate's `total`, accepting numbers and numeric strings.
pub fn aggregate_total(aggregates: &CallAggregates) -> Option<f64> {
    match aggregates.get("total")? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_map<'de, D>(deserializer: D) -> Result<CallAggregates, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    })
}

fn lenient_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// One agent row as extracted from the report table. Duplicates across pages are tolerated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawAgentRow {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub agent_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub agent_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_map")]
    pub incoming_calls: CallAggregates,
    #[serde(default, deserialize_with = "lenient_map")]
    pub outgoing_calls: CallAggregates,
    #[serde(default, deserialize_with = "lenient_string")]
    pub actions: String,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub row_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_details: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryShape {
    /// `all_agents` carried directly on the entry.
    Basic,
    /// `agent_data.rows`, optionally with per-agent `call_details`.
    Enhanced,
    Unrecognized,
}

/// One element of a scrape run's payload (typically one extracted page or page set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportEntry(pub JsonValue);

impl ReportEntry {
    pub fn basic(timestamp: DateTime<Utc>, rows: &[RawAgentRow], pages_processed: usize) -> Self {
        let rows = rows
            .iter()
            .filter_map(|row| serde_json::to_value(row).ok())
            .collect::<Vec<_>>();
        Self(serde_json::json!({
            "timestamp": timestamp.to_rfc3339(),
            "total_agents": rows.len(),
            "pages_processed": pages_processed,
            "extraction_complete": true,
            "all_agents": rows,
        }))
    }

    pub fn timestamp(&self) -> Option<&JsonValue> {
        self.0.get("timestamp").filter(|v| !v.is_null())
    }

    pub fn shape(&self) -> EntryShape {
        if self.0.get("all_agents").is_some() {
            EntryShape::Basic
        } else if self
            .0
            .get("agent_data")
            .and_then(|d| d.get("rows"))
            .is_some()
        {
            EntryShape::Enhanced
        } else {
            EntryShape::Unrecognized
        }
    }

    fn raw_rows(&self) -> &[JsonValue] {
        let rows = match self.shape() {
            EntryShape::Basic => self.0.get("all_agents"),
            EntryShape::Enhanced => self.0.get("agent_data").and_then(|d| d.get("rows")),
            EntryShape::Unrecognized => None,
        };
        rows.and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn agent_row_count(&self) -> usize {
        self.raw_rows().len()
    }

    /// Decodes every agent row. Basic rows never carry call details; enhanced rows
    /// always do (empty when the extractor found none).
    pub fn agent_rows(&self) -> Vec<Result<RawAgentRow, serde_json::Error>> {
        let shape = self.shape();
        self.raw_rows()
            .iter()
            .map(|raw| {
                let mut row: RawAgentRow = serde_json::from_value(raw.clone())?;
                match shape {
                    EntryShape::Basic => row.call_details = None,
                    EntryShape::Enhanced => {
                        if row.call_details.is_none() {
                            row.call_details = Some(JsonValue::Object(Map::new()));
                        }
                    }
                    EntryShape::Unrecognized => {}
                }
                Ok(row)
            })
            .collect()
    }
}

/// Input to the raw report store; the store assigns the save sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawReport {
    pub id: Uuid,
    pub run_id: String,
    pub saved_at: DateTime<Utc>,
    pub period: Period,
    pub period_source: PeriodSource,
    pub rows: Vec<ReportEntry>,
}

/// Full payload of one scrape run, tagged with its resolved period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReport {
    pub id: Uuid,
    pub run_id: String,
    /// Strictly increasing per save; breaks `saved_at` ties.
    pub seq: i64,
    pub saved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub period: Period,
    pub period_source: PeriodSource,
    pub row_count: usize,
    pub agent_row_count: usize,
    pub rows: Vec<ReportEntry>,
}

impl RawReport {
    pub fn from_new(new: NewRawReport, seq: i64) -> Self {
        let agent_row_count = new.rows.iter().map(ReportEntry::agent_row_count).sum();
        Self {
            id: new.id,
            run_id: new.run_id,
            seq,
            saved_at: new.saved_at,
            period: new.period,
            period_source: new.period_source,
            row_count: new.rows.len(),
            agent_row_count,
            rows: new.rows,
        }
    }

    /// Ordering key of the latest-run rule.
    pub fn recency(&self) -> (DateTime<Utc>, i64) {
        (self.saved_at, self.seq)
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            id: self.id,
            run_id: self.run_id.clone(),
            seq: self.seq,
            saved_at: self.saved_at,
            year: self.period.year,
            month: self.period.month,
            month_year: self.period.month_year(),
            period_source: self.period_source,
            row_count: self.row_count,
            agent_row_count: self.agent_row_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub id: Uuid,
    pub run_id: String,
    pub seq: i64,
    pub saved_at: DateTime<Utc>,
    pub year: i32,
    pub month: u32,
    pub month_year: String,
    pub period_source: PeriodSource,
    pub row_count: usize,
    pub agent_row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentKey {
    pub agent_name: String,
    pub period: Period,
}

/// The single authoritative record of one agent in one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPeriodRecord {
    pub id: Uuid,
    pub agent_name: String,
    #[serde(default)]
    pub agent_number: Option<String>,
    #[serde(flatten)]
    pub period: Period,
    /// Last writer.
    pub run_id: String,
    #[serde(default)]
    pub report_timestamp: Option<JsonValue>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub incoming_calls: CallAggregates,
    #[serde(default)]
    pub outgoing_calls: CallAggregates,
    #[serde(default)]
    pub actions: String,
    #[serde(default)]
    pub row_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_details: Option<JsonValue>,
}

impl AgentPeriodRecord {
    pub fn key(&self) -> AgentKey {
        AgentKey {
            agent_name: self.agent_name.clone(),
            period: self.period,
        }
    }

    pub fn incoming_total(&self) -> Option<f64> {
        aggregate_total(&self.incoming_calls)
    }

    pub fn outgoing_total(&self) -> Option<f64> {
        aggregate_total(&self.outgoing_calls)
    }

    pub fn total_calls(&self) -> f64 {
        self.incoming_total().unwrap_or(0.0) + self.outgoing_total().unwrap_or(0.0)
    }
}

/// An agent document without a usable `(year, month)`, as left behind by older schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyAgentRecord {
    pub id: Uuid,
    pub document: Map<String, JsonValue>,
}

impl LegacyAgentRecord {
    pub fn agent_name(&self) -> Option<&str> {
        self.document
            .get("agent_name")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.document.get("last_updated").and_then(parse_timestamp)
    }

    /// Promotes the document to a period record. Missing fields fall back to
    /// empty values; `last_updated` falls back to `fallback_updated`.
    pub fn into_record(
        self,
        period: Period,
        fallback_updated: DateTime<Utc>,
    ) -> Result<AgentPeriodRecord, serde_json::Error> {
        let last_updated = self.last_updated().unwrap_or(fallback_updated);
        let run_id = ["run_id", "task_id"]
            .iter()
            .find_map(|k| self.document.get(*k).and_then(JsonValue::as_str))
            .unwrap_or("legacy")
            .to_string();
        let mut row: RawAgentRow = serde_json::from_value(JsonValue::Object(self.document.clone()))?;
        Ok(AgentPeriodRecord {
            id: self.id,
            agent_name: row.agent_name.take().map(|name| name.trim().to_string()).unwrap_or_default(),
            agent_number: row.agent_number.take(),
            period,
            run_id,
            report_timestamp: self.document.get("report_timestamp").cloned(),
            last_updated,
            incoming_calls: row.incoming_calls,
            outgoing_calls: row.outgoing_calls,
            actions: row.actions,
            row_index: row.row_index,
            call_details: row.call_details,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Persisted state of one scrape-and-save unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub target_period: Option<Period>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data_count: usize,
    pub report_id: Option<Uuid>,
    pub agents_saved: usize,
    pub agents_failed: usize,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn queued(run_id: impl Into<String>, target_period: Option<Period>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            message: message.into(),
            target_period,
            created_at: now,
            updated_at: now,
            data_count: 0,
            report_id: None,
            agents_saved: 0,
            agents_failed: 0,
            error: None,
        }
    }

    pub fn advance(&mut self, status: JobStatus, progress: u8, message: impl Into<String>) {
        self.status = status;
        self.progress = progress.min(100);
        self.message = message.into();
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn period_rejects_out_of_range_months() {
        assert!(Period::new(2025, 0).is_none());
        assert!(Period::new(2025, 13).is_none());
        assert_eq!(Period::new(2025, 12).unwrap().month_name(), "December");
    }

    #[test]
    fn period_walks_back_across_year_boundary() {
        let periods = Period::new(2025, 2).unwrap().walk_back(3);
        assert_eq!(
            periods,
            vec![
                Period::new(2025, 2).unwrap(),
                Period::new(2025, 1).unwrap(),
                Period::new(2024, 12).unwrap(),
            ]
        );
    }

    #[test]
    fn period_last_day_handles_february_and_december() {
        let feb = Period::new(2024, 2).unwrap();
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29));
        let dec = Period::new(2025, 12).unwrap();
        assert_eq!(dec.last_day(), NaiveDate::from_ymd_opt(2025, 12, 31));
    }

    #[test]
    fn month_year_parses_legacy_strings() {
        assert_eq!(Period::parse_month_year("2025-08"), Period::new(2025, 8));
        assert_eq!(Period::parse_month_year("2025-8"), Period::new(2025, 8));
        assert!(Period::parse_month_year("2025").is_none());
        assert!(Period::parse_month_year("2025-13").is_none());
    }

    #[test]
    fn timestamps_parse_in_all_supported_shapes() {
        let expect = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).single().unwrap();
        assert_eq!(parse_timestamp(&json!("2025-03-04T05:06:07Z")), Some(expect));
        assert_eq!(parse_timestamp(&json!("2025-03-04T05:06:07.000+00:00")), Some(expect));
        assert_eq!(parse_timestamp(&json!("2025-03-04T05:06:07.123456")).map(|d| d.date_naive()), Some(expect.date_naive()));
        assert_eq!(parse_timestamp(&json!({"$date": "2025-03-04T05:06:07Z"})), Some(expect));
        assert_eq!(parse_timestamp(&json!({"$date": expect.timestamp_millis()})), Some(expect));
        assert_eq!(parse_timestamp(&json!(expect.timestamp())), Some(expect));
        assert_eq!(parse_timestamp(&json!("not a date")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn integer_timestamps_accept_milliseconds() {
        let expect = Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).single().unwrap();
        assert_eq!(parse_timestamp(&json!(expect.timestamp_millis())), Some(expect));
        assert_eq!(
            timestamp_period(&json!(1736931600000i64)),
            Period::new(2025, 1)
        );
    }

    #[test]
    fn timestamp_period_uses_local_wall_clock_date() {
        assert_eq!(
            timestamp_period(&json!("2025-02-01T00:30:00+02:00")),
            Period::new(2025, 2)
        );
        assert_eq!(
            timestamp_period(&json!("2025-01-31T23:30:00-05:00")),
            Period::new(2025, 1)
        );
        assert_eq!(
            timestamp_period(&json!({"$date": "2025-03-01T01:00:00+03:00"})),
            Period::new(2025, 3)
        );
    }

    #[test]
    fn timestamp_period_rejects_years_out_of_range() {
        assert_eq!(timestamp_period(&json!(i64::MAX / 2)), None);
        assert_eq!(timestamp_period(&json!("0000-06-01T00:00:00")), None);
        assert_eq!(timestamp_period(&json!(i64::MIN)), None);
    }

    #[test]
    fn basic_entry_rows_drop_call_details() {
        let entry = ReportEntry(json!({
            "timestamp": "2025-01-15T09:00:00",
            "all_agents": [
                {"agent_name": "Ivanova", "agent_number": 101, "incoming_calls": {"total": "5"}, "call_details": {"x": 1}},
            ]
        }));
        assert_eq!(entry.shape(), EntryShape::Basic);
        let rows = entry.agent_rows();
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.agent_number.as_deref(), Some("101"));
        assert!(row.call_details.is_none());
        assert_eq!(aggregate_total(&row.incoming_calls), Some(5.0));
    }

    #[test]
    fn enhanced_entry_rows_always_carry_call_details() {
        let entry = ReportEntry(json!({
            "agent_data": {"rows": [
                {"agent_name": "Petrov", "incoming_calls": null},
                {"agent_name": "Sidorov", "call_details": {"incoming_calls": [1, 2]}},
            ]}
        }));
        assert_eq!(entry.shape(), EntryShape::Enhanced);
        let rows: Vec<_> = entry.agent_rows().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(rows[0].call_details, Some(json!({})));
        assert!(rows[0].incoming_calls.is_empty());
        assert_eq!(rows[1].call_details, Some(json!({"incoming_calls": [1, 2]})));
    }

    #[test]
    fn unrecognized_entries_have_no_rows() {
        let entry = ReportEntry(json!({"url": "http://example", "tables": []}));
        assert_eq!(entry.shape(), EntryShape::Unrecognized);
        assert!(entry.agent_rows().is_empty());
    }

    #[test]
    fn raw_fields_survive_in_extra() {
        let row: RawAgentRow = serde_json::from_value(json!({
            "agent_name": "A",
            "raw_Agent": "A"
        }))
        .unwrap();
        assert_eq!(row.extra.get("raw_Agent"), Some(&json!("A")));
    }

    #[test]
    fn legacy_record_promotes_with_task_id_as_run_id() {
        let doc = json!({
            "agent_name": "Ivanova",
            "task_id": "task_20240105_101010",
            "incoming_calls": {"total": "7"},
            "last_updated": {"$date": "2024-01-05T10:10:10Z"}
        });
        let legacy = LegacyAgentRecord {
            id: Uuid::new_v4(),
            document: doc.as_object().unwrap().clone(),
        };
        let record = legacy
            .into_record(Period::new(2024, 1).unwrap(), Utc::now())
            .unwrap();
        assert_eq!(record.run_id, "task_20240105_101010");
        assert_eq!(record.incoming_total(), Some(7.0));
        assert_eq!(record.last_updated.year(), 2024);
    }

    #[test]
    fn legacy_names_are_trimmed_like_fresh_rows() {
        let legacy = LegacyAgentRecord {
            id: Uuid::new_v4(),
            document: json!({"agent_name": "  Ivanova "}).as_object().unwrap().clone(),
        };
        assert_eq!(legacy.agent_name(), Some("Ivanova"));
        let record = legacy
            .into_record(Period::new(2024, 11).unwrap(), Utc::now())
            .unwrap();
        assert_eq!(record.agent_name, "Ivanova");

        let blank = LegacyAgentRecord {
            id: Uuid::new_v4(),
            document: json!({"agent_name": "   "}).as_object().unwrap().clone(),
        };
        assert_eq!(blank.agent_name(), None);
    }

    #[test]
    fn raw_report_counts_entries_and_agent_rows() {
        let report = RawReport::from_new(
            NewRawReport {
                id: Uuid::new_v4(),
                run_id: "task_x".into(),
                saved_at: Utc::now(),
                period: Period::new(2025, 1).unwrap(),
                period_source: PeriodSource::Explicit,
                rows: vec![
                    ReportEntry(json!({"all_agents": [{"agent_name": "a"}, {"agent_name": "b"}]})),
                    ReportEntry(json!({"agent_data": {"rows": [{"agent_name": "c"}]}})),
                ],
            },
            7,
        );
        assert_eq!(report.row_count, 2);
        assert_eq!(report.agent_row_count, 3);
        assert_eq!(report.summary().month_year, "2025-01");
    }
}
