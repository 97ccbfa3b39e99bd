use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::expand::{first_occurrence_utc_ms, occurrences_up_to_bound};
use crate::rule::RecurrenceRule;
use crate::time_errors::TimeErrorCode;
use crate::{AppError, AppResult};

/// Upper bound on occurrences materialized when computing the last instant
/// of a COUNT-bounded series for validation.
const BOUNDS_CAP: usize = 10_000;

/// UTC span a series' exclusions must fall inside. `last` is `None` for an
/// unbounded series (no COUNT, no UNTIL), in which case only the lower bound
/// applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesBoundsUtc {
    pub first: Option<i64>,
    pub last: Option<i64>,
}

impl SeriesBoundsUtc {
    /// Derive bounds from a parsed rule and its local anchor.
    pub fn from_rule(rule: &RecurrenceRule, anchor_local: NaiveDateTime, tz: Tz) -> Self {
        let first = first_occurrence_utc_ms(rule, anchor_local, tz);
        let last = if let Some(until) = rule.until {
            Some(until.timestamp_millis())
        } else if rule.count.is_some() {
            let all = occurrences_up_to_bound(rule, anchor_local, tz, BOUNDS_CAP);
            if all.len() < BOUNDS_CAP {
                all.last().copied()
            } else {
                None
            }
        } else {
            None
        };
        SeriesBoundsUtc { first, last }
    }

    fn contains(&self, ms: i64) -> bool {
        if let Some(first) = self.first {
            if ms < first {
                return false;
            }
        }
        if let Some(last) = self.last {
            if ms > last {
                return false;
            }
        }
        true
    }
}

pub fn split_csv_exdates(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn invalid_format(entry: &str) -> AppError {
    TimeErrorCode::ExdateInvalidFormat
        .into_error()
        .with_context("entry", entry.to_string())
}

fn out_of_range(entry: &str) -> AppError {
    TimeErrorCode::ExdateOutOfRange
        .into_error()
        .with_context("entry", entry.to_string())
}

fn parse_utc_token(token: &str) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(token).ok()?;
    if !token.ends_with('Z') || parsed.offset().local_minus_utc() != 0 {
        return None;
    }
    Some(parsed.with_timezone(&Utc).timestamp_millis())
}

/// Write-path EXDATE validation. Every entry must be RFC 3339 UTC with a `Z`
/// suffix (`E_EXDATE_INVALID_FORMAT` otherwise, naming the entry) and must
/// fall inside the series' bounds (`E_EXDATE_OUT_OF_RANGE`). An in-range
/// instant that matches no occurrence is accepted here; it is a no-op at
/// expansion time. Duplicates collapse.
pub fn parse_exdates(raw: &str, bounds: &SeriesBoundsUtc) -> AppResult<BTreeSet<i64>> {
    let mut out = BTreeSet::new();
    for token in split_csv_exdates(raw) {
        let ms = parse_utc_token(&token).ok_or_else(|| invalid_format(&token))?;
        if !bounds.contains(ms) {
            return Err(out_of_range(&token));
        }
        out.insert(ms);
    }
    Ok(out)
}

/// Read-path EXDATE parse. Stored data may predate write-path validation, so
/// malformed entries are skipped with a warning instead of failing the query.
pub fn parse_exdates_lenient(event_id: &str, raw: &str) -> BTreeSet<i64> {
    let mut out = BTreeSet::new();
    for token in split_csv_exdates(raw) {
        match parse_utc_token(&token) {
            Some(ms) => {
                out.insert(ms);
            }
            None => {
                warn!(
                    target: "kinloch",
                    event = "exdate_skipped_invalid",
                    event_id = %event_id,
                    entry = %token
                );
            }
        }
    }
    out
}

/// Canonical storage encoding: ascending RFC 3339 UTC instants joined by
/// commas, or `None` for an empty set.
pub fn canonical_exdates(set: &BTreeSet<i64>) -> Option<String> {
    if set.is_empty() {
        return None;
    }
    let parts: Vec<String> = set
        .iter()
        .filter_map(|ms| DateTime::<Utc>::from_timestamp_millis(*ms))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .collect();
    Some(parts.join(","))
}

/// Tolerant classification of a stored EXDATE list, used by the
/// normalization pass over pre-existing rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExdateInspection {
    pub canonical: Option<String>,
    #[serde(skip_serializing)]
    pub valid: BTreeSet<i64>,
    pub invalid_format: Vec<String>,
    pub non_utc: Vec<String>,
    pub out_of_range: Vec<String>,
    pub duplicates: usize,
    pub total_inputs: usize,
}

pub fn inspect_exdates<I>(values: I, bounds: &SeriesBoundsUtc) -> ExdateInspection
where
    I: IntoIterator<Item = String>,
{
    let mut inspection = ExdateInspection::default();

    for raw in values {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        inspection.total_inputs += 1;
        match DateTime::parse_from_rfc3339(trimmed) {
            Ok(parsed) => {
                if !trimmed.ends_with('Z') || parsed.offset().local_minus_utc() != 0 {
                    inspection.non_utc.push(trimmed.to_string());
                    continue;
                }
                let ms = parsed.with_timezone(&Utc).timestamp_millis();
                if !bounds.contains(ms) {
                    inspection.out_of_range.push(trimmed.to_string());
                    continue;
                }
                if !inspection.valid.insert(ms) {
                    inspection.duplicates += 1;
                }
            }
            Err(_) => inspection.invalid_format.push(trimmed.to_string()),
        }
    }

    inspection.canonical = canonical_exdates(&inspection.valid);
    inspection
}

const MAX_LOGGED_EXAMPLES: usize = 20;

#[derive(Debug, Default, Serialize)]
pub struct ExdateNormalizeStats {
    pub scanned: u64,
    pub updated: u64,
    pub cleared: u64,
    pub total_inputs: u64,
    pub total_valid: u64,
    pub invalid_format: u64,
    pub non_utc: u64,
    pub out_of_range: u64,
    pub duplicates_removed: u64,
}

/// Rewrite every stored EXDATE list into canonical form, dropping entries
/// that fail the tolerant inspection. Idempotent: a second run finds nothing
/// to change.
pub async fn normalize_stored_exdates(pool: &SqlitePool) -> Result<ExdateNormalizeStats> {
    let rows = sqlx::query(
        "SELECT id, start_at_utc, rrule, exdates FROM events WHERE exdates IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut stats = ExdateNormalizeStats::default();
    let mut invalid_examples = Vec::new();
    let mut range_examples = Vec::new();

    for row in rows {
        stats.scanned += 1;
        let event_id: String = row.try_get("id")?;
        let start_at_utc: Option<i64> = row.try_get("start_at_utc").ok();
        let rrule: Option<String> = row.try_get("rrule").ok();
        let raw_exdates: String = row.try_get("exdates")?;

        let tokens = split_csv_exdates(&raw_exdates);
        if tokens.is_empty() {
            sqlx::query("UPDATE events SET exdates = NULL WHERE id = ?")
                .bind(&event_id)
                .execute(pool)
                .await?;
            stats.updated += 1;
            stats.cleared += 1;
            continue;
        }

        // Bounds from the cached first instant and the rule's UNTIL; COUNT
        // bounds are not re-derived here because the local anchor's zone is
        // not loaded in this pass.
        let bounds = SeriesBoundsUtc {
            first: start_at_utc,
            last: rrule
                .as_deref()
                .and_then(|r| crate::rule::parse_rule(r).ok())
                .and_then(|r| r.until)
                .map(|u| u.timestamp_millis()),
        };
        let inspection = inspect_exdates(tokens, &bounds);

        stats.total_inputs += inspection.total_inputs as u64;
        stats.total_valid += inspection.valid.len() as u64;
        stats.invalid_format += inspection.invalid_format.len() as u64;
        stats.non_utc += inspection.non_utc.len() as u64;
        stats.out_of_range += inspection.out_of_range.len() as u64;
        stats.duplicates_removed += inspection.duplicates as u64;

        for value in inspection
            .invalid_format
            .iter()
            .chain(inspection.non_utc.iter())
        {
            if invalid_examples.len() < MAX_LOGGED_EXAMPLES {
                invalid_examples.push(format!("{event_id}:{value}"));
            }
        }
        for value in &inspection.out_of_range {
            if range_examples.len() < MAX_LOGGED_EXAMPLES {
                range_examples.push(format!("{event_id}:{value}"));
            }
        }

        match inspection.canonical {
            Some(ref canonical) => {
                if canonical != &raw_exdates {
                    sqlx::query("UPDATE events SET exdates = ? WHERE id = ?")
                        .bind(canonical)
                        .bind(&event_id)
                        .execute(pool)
                        .await?;
                    stats.updated += 1;
                }
            }
            None => {
                sqlx::query("UPDATE events SET exdates = NULL WHERE id = ?")
                    .bind(&event_id)
                    .execute(pool)
                    .await?;
                stats.updated += 1;
                stats.cleared += 1;
            }
        }
    }

    if !invalid_examples.is_empty() {
        warn!(
            target: "kinloch",
            event = "exdate_normalize_invalid",
            examples = %invalid_examples.join(", "),
            total_invalid = stats.invalid_format + stats.non_utc
        );
    }
    if !range_examples.is_empty() {
        warn!(
            target: "kinloch",
            event = "exdate_normalize_out_of_range",
            examples = %range_examples.join(", "),
            total_out_of_range = stats.out_of_range
        );
    }

    info!(
        target: "kinloch",
        event = "exdate_normalize_summary",
        scanned = stats.scanned,
        updated = stats.updated,
        cleared = stats.cleared,
        total_inputs = stats.total_inputs,
        total_valid = stats.total_valid,
        invalid_format = stats.invalid_format,
        non_utc = stats.non_utc,
        out_of_range = stats.out_of_range,
        duplicates_removed = stats.duplicates_removed
    );

    Ok(stats)
}
