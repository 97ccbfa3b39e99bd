use std::{
    collections::BTreeMap,
    fmt::{self, Write},
};

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, SqlitePool};

use crate::expand::first_occurrence_utc_ms;
use crate::model::Household;
use crate::rule::parse_rule;
use crate::time;
use crate::time_errors::TimeErrorCode;
use crate::tz::{local_ms_to_utc_ms, TzDb};
use crate::{AppError, AppResult};

const OPERATION: &str = "drift_check";
pub const DEFAULT_TOLERANCE_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftCategory {
    CacheMismatch,
    TzUnresolvable,
}

impl fmt::Display for DriftCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftCategory::CacheMismatch => write!(f, "cache_mismatch"),
            DriftCategory::TzUnresolvable => write!(f, "tz_unresolvable"),
        }
    }
}

/// One advisory finding. Carries both the cached and the recomputed instant
/// so a reviewer can see the disagreement; nothing is ever auto-corrected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftRecord {
    pub code: String,
    pub event_id: String,
    pub household_id: String,
    pub cached_start_at_utc: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_end_at_utc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recomputed_start_at_utc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recomputed_end_at_utc: Option<i64>,
    pub delta_ms: i64,
    pub category: DriftCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DriftReport {
    pub total_events: usize,
    pub tzdb_version: String,
    pub tolerance_ms: i64,
    pub drift_events: Vec<DriftRecord>,
    pub counts_by_category: BTreeMap<DriftCategory, usize>,
    pub counts_by_household: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct DriftCheckOptions {
    pub household_id: Option<String>,
    pub tolerance_ms: i64,
}

impl Default for DriftCheckOptions {
    fn default() -> Self {
        DriftCheckOptions {
            household_id: None,
            tolerance_ms: DEFAULT_TOLERANCE_MS,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct EventRow {
    id: String,
    household_id: String,
    start_at: i64,
    end_at: Option<i64>,
    tz: Option<String>,
    rrule: Option<String>,
    start_at_utc: i64,
    end_at_utc: Option<i64>,
}

fn diff_ms(a: i64, b: i64) -> i64 {
    (i128::from(a) - i128::from(b)).abs() as i64
}

fn build_record(
    row: &EventRow,
    category: DriftCategory,
    recomputed_start: Option<i64>,
    recomputed_end: Option<i64>,
    delta_ms: i64,
) -> DriftRecord {
    DriftRecord {
        code: TimeErrorCode::TimezoneDriftDetected.as_str().to_string(),
        event_id: row.id.clone(),
        household_id: row.household_id.clone(),
        cached_start_at_utc: row.start_at_utc,
        cached_end_at_utc: row.end_at_utc,
        recomputed_start_at_utc: recomputed_start,
        recomputed_end_at_utc: recomputed_end,
        delta_ms,
        category,
    }
}

/// Recompute the row's first-occurrence UTC instant from its wall-clock
/// anchor, zone, and rule, and compare against the stored cache.
fn evaluate_row(
    tzdb: &TzDb,
    household_tz: Option<&str>,
    tolerance_ms: i64,
    row: &EventRow,
) -> AppResult<Option<DriftRecord>> {
    let tz = match tzdb.effective_tz(row.tz.as_deref(), household_tz) {
        Ok(tz) => tz,
        Err(_) => {
            return Ok(Some(build_record(
                row,
                DriftCategory::TzUnresolvable,
                None,
                None,
                0,
            )));
        }
    };

    let anchor_local = time::naive_from_ms(row.start_at).map_err(|err| {
        err.with_context("operation", OPERATION)
            .with_context("event_id", row.id.clone())
    })?;
    let direct_start = local_ms_to_utc_ms(tz, row.start_at).map_err(|err| {
        err.with_context("operation", OPERATION)
            .with_context("event_id", row.id.clone())
    })?;
    let recomputed_start = match row.rrule.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => match parse_rule(raw) {
            Ok(rule) => first_occurrence_utc_ms(&rule, anchor_local, tz).unwrap_or(direct_start),
            // A rule that no longer parses cannot prove drift either way.
            Err(_) => direct_start,
        },
        None => direct_start,
    };

    let mut delta = diff_ms(row.start_at_utc, recomputed_start);
    let recomputed_end = match (row.end_at, row.end_at_utc) {
        (Some(end_at), Some(cached_end)) => {
            let recomputed = local_ms_to_utc_ms(tz, end_at).map_err(|err| {
                err.with_context("operation", OPERATION)
                    .with_context("event_id", row.id.clone())
            })?;
            delta = delta.max(diff_ms(cached_end, recomputed));
            Some(recomputed)
        }
        _ => None,
    };

    if delta >= tolerance_ms {
        return Ok(Some(build_record(
            row,
            DriftCategory::CacheMismatch,
            Some(recomputed_start),
            recomputed_end,
            delta,
        )));
    }

    Ok(None)
}

/// Scan cached rows and report every event whose cache no longer agrees with
/// a fresh conversion under the injected timezone data. Read-only.
pub async fn run_drift_check(
    pool: &SqlitePool,
    tzdb: &TzDb,
    options: DriftCheckOptions,
) -> AppResult<DriftReport> {
    let household_zones: BTreeMap<String, Option<String>> =
        sqlx::query_as::<_, Household>("SELECT id, name, tz FROM household")
            .fetch_all(pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", OPERATION)
                    .with_context("step", "query_households")
            })?
            .into_iter()
            .map(|hh| (hh.id, hh.tz))
            .collect();

    let mut builder = QueryBuilder::new(
        "SELECT id, household_id, start_at, end_at, tz, rrule, start_at_utc, end_at_utc \
         FROM events \
         WHERE deleted_at IS NULL \
           AND start_at_utc IS NOT NULL",
    );
    if let Some(hh) = &options.household_id {
        builder.push(" AND household_id = ");
        builder.push_bind(hh);
    }
    builder.push(" ORDER BY household_id, start_at, id");

    let rows: Vec<EventRow> = builder
        .build_query_as()
        .fetch_all(pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", OPERATION)
                .with_context("step", "query_events")
        })?;

    let mut drift_events = Vec::new();
    for row in rows.iter() {
        let household_tz = household_zones
            .get(&row.household_id)
            .and_then(|tz| tz.as_deref());
        if let Some(record) = evaluate_row(tzdb, household_tz, options.tolerance_ms, row)? {
            drift_events.push(record);
        }
    }

    let mut counts_by_category = BTreeMap::new();
    let mut counts_by_household = BTreeMap::new();
    for record in &drift_events {
        *counts_by_category
            .entry(record.category.clone())
            .or_insert(0) += 1;
        *counts_by_household
            .entry(record.household_id.clone())
            .or_insert(0) += 1;
    }

    Ok(DriftReport {
        total_events: rows.len(),
        tzdb_version: tzdb.version().to_string(),
        tolerance_ms: options.tolerance_ms,
        drift_events,
        counts_by_category,
        counts_by_household,
    })
}

pub fn format_human_summary(report: &DriftReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Timezone Drift Report");
    let _ = writeln!(out, "=====================");
    let _ = writeln!(out, "Events checked: {}", report.total_events);
    let _ = writeln!(out, "Drift events:   {}", report.drift_events.len());
    let _ = writeln!(out, "Tolerance:      {}ms", report.tolerance_ms);
    let _ = writeln!(out, "Tzdb version:   {}", report.tzdb_version);
    if report.drift_events.is_empty() {
        let _ = writeln!(out, "Status:         OK (no drift detected)");
    } else {
        let _ = writeln!(out, "Status:         Drift detected");
    }

    let _ = writeln!(out, "\nBy category:");
    if report.counts_by_category.is_empty() {
        let _ = writeln!(out, "  (none)");
    } else {
        for (category, count) in &report.counts_by_category {
            let _ = writeln!(out, "  {}: {}", category, count);
        }
    }

    let _ = writeln!(out, "\nBy household:");
    if report.counts_by_household.is_empty() {
        let _ = writeln!(out, "  (none)");
    } else {
        for (household, count) in &report.counts_by_household {
            let _ = writeln!(out, "  {}: {}", household, count);
        }
    }

    if !report.drift_events.is_empty() {
        let _ = writeln!(out, "\nReview the affected items before continuing.");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    fn row(tz: Option<&str>, rrule: Option<&str>, start_at: i64, start_at_utc: i64) -> EventRow {
        EventRow {
            id: "e1".into(),
            household_id: "hh".into(),
            start_at,
            end_at: None,
            tz: tz.map(str::to_string),
            rrule: rrule.map(str::to_string),
            start_at_utc,
            end_at_utc: None,
        }
    }

    #[test]
    fn diff_ms_handles_large_values() {
        assert_eq!(diff_ms(0, 0), 0);
        assert_eq!(diff_ms(1, -1), 2);
        assert_eq!(diff_ms(i64::MAX, i64::MAX - 10), 10);
    }

    #[test]
    fn agreeing_cache_yields_no_finding() {
        let tzdb = TzDb::bundled();
        // 09:00 New York EST caches at 14:00Z.
        let r = row(
            Some("America/New_York"),
            None,
            ms(2024, 1, 15, 9),
            ms(2024, 1, 15, 14),
        );
        let got = evaluate_row(&tzdb, None, DEFAULT_TOLERANCE_MS, &r).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn stale_cache_beyond_tolerance_is_flagged() {
        let tzdb = TzDb::bundled();
        // Cache is one hour off, as if computed under a stale offset.
        let r = row(
            Some("America/New_York"),
            None,
            ms(2024, 1, 15, 9),
            ms(2024, 1, 15, 15),
        );
        let record = evaluate_row(&tzdb, None, DEFAULT_TOLERANCE_MS, &r)
            .unwrap()
            .expect("finding");
        assert_eq!(record.code, "E_TZ_DRIFT_DETECTED");
        assert_eq!(record.category, DriftCategory::CacheMismatch);
        assert_eq!(record.delta_ms, 3_600_000);
        assert_eq!(record.recomputed_start_at_utc, Some(ms(2024, 1, 15, 14)));
    }

    #[test]
    fn sub_tolerance_delta_is_ignored() {
        let tzdb = TzDb::bundled();
        let r = row(
            Some("UTC"),
            None,
            ms(2024, 1, 15, 9),
            ms(2024, 1, 15, 9) + 30_000,
        );
        assert!(evaluate_row(&tzdb, None, DEFAULT_TOLERANCE_MS, &r)
            .unwrap()
            .is_none());
    }

    #[test]
    fn unresolvable_zone_is_its_own_category() {
        let tzdb = TzDb::bundled();
        let r = row(Some("Mars/Gale"), None, ms(2024, 1, 15, 9), 0);
        let record = evaluate_row(&tzdb, None, DEFAULT_TOLERANCE_MS, &r)
            .unwrap()
            .expect("finding");
        assert_eq!(record.category, DriftCategory::TzUnresolvable);
        assert!(record.recomputed_start_at_utc.is_none());
    }

    #[test]
    fn household_fallback_zone_is_used_for_recompute() {
        let tzdb = TzDb::bundled();
        let r = row(None, None, ms(2025, 1, 15, 10), ms(2025, 1, 15, 1));
        // 10:00 Tokyo is 01:00Z; fallback makes the cache agree.
        assert!(
            evaluate_row(&tzdb, Some("Asia/Tokyo"), DEFAULT_TOLERANCE_MS, &r)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn recurring_row_compares_first_occurrence() {
        let tzdb = TzDb::bundled();
        // Weekly on Wednesday, anchored on a Monday: the first occurrence is
        // two days after the anchor, and the cache holds that instant.
        let r = row(
            Some("UTC"),
            Some("FREQ=WEEKLY;BYDAY=WE;COUNT=4"),
            ms(2024, 1, 1, 9),
            ms(2024, 1, 3, 9),
        );
        assert!(evaluate_row(&tzdb, None, DEFAULT_TOLERANCE_MS, &r)
            .unwrap()
            .is_none());
    }

    #[test]
    fn human_summary_ends_with_review_copy_when_drift_found() {
        let mut report = DriftReport {
            total_events: 3,
            tzdb_version: "2024a".into(),
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            ..Default::default()
        };
        assert!(!format_human_summary(&report).contains("Review the affected items"));

        report.drift_events.push(DriftRecord {
            code: "E_TZ_DRIFT_DETECTED".into(),
            event_id: "e1".into(),
            household_id: "hh".into(),
            cached_start_at_utc: 0,
            cached_end_at_utc: None,
            recomputed_start_at_utc: Some(3_600_000),
            recomputed_end_at_utc: None,
            delta_ms: 3_600_000,
            category: DriftCategory::CacheMismatch,
        });
        let text = format_human_summary(&report);
        assert!(text.ends_with("Review the affected items before continuing.\n"));
    }
}
