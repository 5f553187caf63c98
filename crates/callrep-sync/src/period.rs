use callrep_core::{timestamp_period, Period, PeriodSource, ResolvedPeriod};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

/// Date embedded in a `task_YYYYMMDD...` run id.
pub fn run_id_date(run_id: &str) -> Option<NaiveDate> {
    let digits = run_id.strip_prefix("task_")?.get(..8)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Caller-supplied period. Both parts are required; anything partial or out of range
/// is ignored so resolution falls through to the record's own data.
pub fn explicit_period(year: Option<i32>, month: Option<u32>) -> Option<Period> {
    match (year, month) {
        (Some(year), Some(month)) => {
            let period = Period::new(year, month);
            if period.is_none() {
                warn!(year, month, "ignoring out-of-range explicit period");
            }
            period
        }
        (None, None) => None,
        (year, month) => {
            warn!(?year, ?month, "ignoring partial explicit period");
            None
        }
    }
}

/// Resolves the period a record belongs to. `timestamps` are candidate timestamp values
/// in priority order (a row's own timestamp before its report's).
///
/// Never fails: without an explicit period, a parseable timestamp or a dated run id,
/// the current processing time is used and the result is flagged as degraded.
pub fn resolve_period(
    timestamps: &[Option<&JsonValue>],
    run_id: &str,
    explicit_year: Option<i32>,
    explicit_month: Option<u32>,
) -> ResolvedPeriod {
    resolve_period_at(
        timestamps,
        run_id,
        explicit_period(explicit_year, explicit_month),
        Utc::now(),
    )
}

pub fn resolve_period_at(
    timestamps: &[Option<&JsonValue>],
    run_id: &str,
    explicit: Option<Period>,
    now: DateTime<Utc>,
) -> ResolvedPeriod {
    if let Some(period) = explicit {
        return ResolvedPeriod {
            period,
            source: PeriodSource::Explicit,
        };
    }

    for candidate in timestamps.iter().flatten() {
        match timestamp_period(candidate) {
            Some(period) => {
                return ResolvedPeriod {
                    period,
                    source: PeriodSource::RecordTimestamp,
                }
            }
            None => debug!(run_id, value = %candidate, "unusable record timestamp"),
        }
    }

    if let Some(period) = run_id_date(run_id).and_then(|date| Period::new(date.year(), date.month())) {
        return ResolvedPeriod {
            period,
            source: PeriodSource::RunId,
        };
    }

    let period = Period::from_date(&now);
    warn!(run_id, period = %period, "no period information found; using processing time");
    ResolvedPeriod {
        period,
        source: PeriodSource::ProcessingTime,
    }
}

/// `task_YYYYMMDD_HHMMSS_xxxxxx`; targeted runs carry the first day of the target month
/// so the id itself resolves to the right period.
pub fn generate_run_id(now: DateTime<Utc>, target: Option<Period>) -> String {
    let date = match target {
        Some(period) => format!("{:04}{:02}01", period.year, period.month),
        None => now.format("%Y%m%d").to_string(),
    };
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task_{date}_{}_{}", now.format("%H%M%S"), &suffix[..6])
}
