use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::expand::first_occurrence_utc_ms;
use crate::rule::parse_rule;
use crate::time;
use crate::tz::{local_ms_to_utc_ms, utc_ms_to_local_ms, TzDb};
use crate::{AppError, AppResult};

pub const MIN_CHUNK_SIZE: usize = 10;
pub const MAX_CHUNK_SIZE: usize = 5_000;
pub const MIN_PROGRESS_INTERVAL_MS: u64 = 100;
pub const MAX_PROGRESS_INTERVAL_MS: u64 = 60_000;

/// Values below this magnitude are read as epoch seconds; at or above, epoch
/// milliseconds. 1e11 ms is 1973, 1e11 s is year 5138, so real event data
/// never straddles the cut.
const EPOCH_SECONDS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub household_id: String,
    pub default_tz: Option<String>,
    pub chunk_size: usize,
    /// Minimum gap between progress callbacks; `0` emits every chunk.
    pub progress_interval_ms: u64,
    pub dry_run: bool,
    pub reset_checkpoint: bool,
}

/// Cooperative cancellation handle. Cancelling lets the in-flight chunk
/// commit, then stops before the next one.
#[derive(Debug, Clone, Default)]
pub struct BackfillControl {
    cancelled: Arc<AtomicBool>,
}

impl BackfillControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillProgress {
    pub household_id: String,
    pub scanned: u64,
    pub updated: u64,
    pub skipped: u64,
    pub remaining: u64,
    pub elapsed_ms: u64,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillChunkStats {
    /// 1-based chunk ordinal, reported after the chunk's transaction commits.
    pub chunk_index: u64,
    pub scanned: u64,
    pub updated: u64,
    pub skipped: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub household_id: String,
    pub total_scanned: u64,
    pub total_updated: u64,
    pub total_skipped: u64,
    pub elapsed_ms: u64,
    pub status: BackfillStatus,
}

pub type ProgressCallback = Arc<dyn Fn(BackfillProgress) + Send + Sync>;
pub type ChunkObserver = Arc<dyn Fn(BackfillChunkStats) + Send + Sync>;

/// Decode a legacy integer timestamp into canonical epoch milliseconds.
fn decode_legacy_int_ms(value: i64) -> i64 {
    if value.abs() < EPOCH_SECONDS_CUTOFF {
        value.saturating_mul(1000)
    } else {
        value
    }
}

/// Decode a legacy textual timestamp. Offset-bearing strings contribute
/// their wall-clock part; the zone column owns the offset.
fn decode_legacy_text_ms(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.naive_local().and_utc().timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed.and_utc().timestamp_millis());
        }
        if format == "%Y-%m-%d" {
            if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, format) {
                return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
            }
        }
    }
    None
}

/// Pull a timestamp column that may hold an INTEGER or a legacy TEXT value.
fn read_wall_clock(row: &sqlx::sqlite::SqliteRow, column: &str) -> Option<i64> {
    if let Ok(value) = row.try_get::<i64, _>(column) {
        return Some(decode_legacy_int_ms(value));
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(column) {
        return value.as_deref().and_then(decode_legacy_text_ms);
    }
    None
}

struct ResolvedZones {
    default_tz: Option<Tz>,
    household_tz: Option<Tz>,
}

struct ChunkOutcome {
    scanned: u64,
    updated: u64,
    skipped: u64,
    last_rowid: i64,
}

/// Normalize every event row of a household: canonical epoch-ms wall clocks,
/// a concrete zone name, and recomputed `start_at_utc`/`end_at_utc` caches.
///
/// One transaction per chunk; the checkpoint row advances inside that same
/// transaction, so a crash or cancellation between chunks loses nothing and
/// a re-run continues where the last commit left off. Running again over
/// already-canonical rows updates nothing.
pub async fn run_events_backfill(
    pool: &SqlitePool,
    tzdb: &TzDb,
    options: BackfillOptions,
    control: Option<BackfillControl>,
    progress: Option<ProgressCallback>,
    observer: Option<ChunkObserver>,
) -> AppResult<BackfillSummary> {
    validate_options(&options)?;
    let household_id = options.household_id.clone();

    let default_tz = match options.default_tz.as_deref() {
        Some(name) => Some(tzdb.resolve(name).map_err(|err| {
            AppError::new("BACKFILL/INVALID_TIMEZONE", "Unknown fallback timezone")
                .with_context("timezone", name.to_string())
                .with_cause(err)
        })?),
        None => None,
    };

    let household_tz_name: Option<String> =
        sqlx::query_scalar("SELECT tz FROM household WHERE id = ?")
            .bind(&household_id)
            .fetch_optional(pool)
            .await
            .map_err(|err| backfill_err(err, &household_id, "load_household"))?
            .flatten();
    let household_tz = match household_tz_name.as_deref() {
        Some(name) if !name.trim().is_empty() => match tzdb.resolve(name) {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(
                    target: "kinloch",
                    event = "backfill_household_tz_invalid",
                    household_id = %household_id,
                    timezone = %name
                );
                None
            }
        },
        _ => None,
    };
    let zones = ResolvedZones {
        default_tz,
        household_tz,
    };

    ensure_checkpoint_table(pool, &household_id).await?;
    if options.reset_checkpoint && !options.dry_run {
        sqlx::query("DELETE FROM events_backfill_checkpoint WHERE household_id = ?")
            .bind(&household_id)
            .execute(pool)
            .await
            .map_err(|err| backfill_err(err, &household_id, "reset_checkpoint"))?;
    }

    let (mut last_rowid, mut total_processed, mut total_updated, mut total_skipped) =
        if options.dry_run {
            (0i64, 0u64, 0u64, 0u64)
        } else {
            load_checkpoint(pool, &household_id).await?
        };

    let remaining_at_start: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM events WHERE household_id = ? AND deleted_at IS NULL AND rowid > ?",
    )
    .bind(&household_id)
    .bind(last_rowid)
    .fetch_one(pool)
    .await
    .map_err(|err| backfill_err(err, &household_id, "count_remaining"))?;
    let grand_total = total_processed + remaining_at_start as u64;

    let started = Instant::now();
    let mut last_progress_at = 0u64;
    let mut run_scanned = 0u64;
    let mut run_updated = 0u64;
    let mut run_skipped = 0u64;
    let mut chunk_index = 0u64;
    let mut status = BackfillStatus::Completed;

    loop {
        if control.as_ref().is_some_and(BackfillControl::is_cancelled) {
            status = BackfillStatus::Cancelled;
            break;
        }

        let chunk_started = Instant::now();
        let outcome = process_chunk(pool, tzdb, &options, &zones, last_rowid, |totals| {
            Checkpoint {
                last_rowid: totals.last_rowid,
                processed: total_processed + run_scanned + totals.scanned,
                updated: total_updated + run_updated + totals.updated,
                skipped: total_skipped + run_skipped + totals.skipped,
                total: grand_total,
            }
        })
        .await?;

        if outcome.scanned == 0 {
            break;
        }

        chunk_index += 1;
        run_scanned += outcome.scanned;
        run_updated += outcome.updated;
        run_skipped += outcome.skipped;
        last_rowid = outcome.last_rowid;

        if let Some(observer) = &observer {
            observer(BackfillChunkStats {
                chunk_index,
                scanned: outcome.scanned,
                updated: outcome.updated,
                skipped: outcome.skipped,
                elapsed_ms: chunk_started.elapsed().as_millis() as u64,
            });
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let due = options.progress_interval_ms == 0
            || elapsed_ms.saturating_sub(last_progress_at) >= options.progress_interval_ms;
        if due {
            if let Some(progress) = &progress {
                progress(BackfillProgress {
                    household_id: household_id.clone(),
                    scanned: run_scanned,
                    updated: run_updated,
                    skipped: run_skipped,
                    remaining: (remaining_at_start as u64).saturating_sub(run_scanned),
                    elapsed_ms,
                    chunk_size: options.chunk_size,
                });
            }
            last_progress_at = elapsed_ms;
        }

        if outcome.scanned < options.chunk_size as u64 {
            break;
        }
    }

    total_processed += run_scanned;
    total_updated += run_updated;
    total_skipped += run_skipped;

    let summary = BackfillSummary {
        household_id: household_id.clone(),
        total_scanned: run_scanned,
        total_updated: run_updated,
        total_skipped: run_skipped,
        elapsed_ms: started.elapsed().as_millis() as u64,
        status,
    };
    info!(
        target: "kinloch",
        event = "backfill_summary",
        household_id = %household_id,
        scanned = summary.total_scanned,
        updated = summary.total_updated,
        skipped = summary.total_skipped,
        processed_lifetime = total_processed,
        updated_lifetime = total_updated,
        skipped_lifetime = total_skipped,
        elapsed_ms = summary.elapsed_ms,
        status = ?summary.status,
        dry_run = options.dry_run
    );
    Ok(summary)
}

fn validate_options(options: &BackfillOptions) -> AppResult<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&options.chunk_size) {
        return Err(
            AppError::new("BACKFILL/INVALID_CHUNK_SIZE", "Chunk size out of range")
                .with_context("chunk_size", options.chunk_size.to_string()),
        );
    }
    let interval = options.progress_interval_ms;
    if interval != 0 && !(MIN_PROGRESS_INTERVAL_MS..=MAX_PROGRESS_INTERVAL_MS).contains(&interval) {
        return Err(AppError::new(
            "BACKFILL/INVALID_PROGRESS_INTERVAL",
            "Progress interval out of range",
        )
        .with_context("progress_interval", interval.to_string()));
    }
    Ok(())
}

fn backfill_err(err: sqlx::Error, household_id: &str, step: &str) -> AppError {
    AppError::from(err)
        .with_context("operation", "events_backfill")
        .with_context("step", step.to_string())
        .with_context("household_id", household_id.to_string())
}

async fn ensure_checkpoint_table(pool: &SqlitePool, household_id: &str) -> AppResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS events_backfill_checkpoint (\
             household_id TEXT PRIMARY KEY,\
             last_rowid INTEGER NOT NULL DEFAULT 0,\
             processed INTEGER NOT NULL DEFAULT 0,\
             updated INTEGER NOT NULL DEFAULT 0,\
             skipped INTEGER NOT NULL DEFAULT 0,\
             total INTEGER NOT NULL DEFAULT 0,\
             updated_at INTEGER NOT NULL DEFAULT 0\
         )",
    )
    .execute(pool)
    .await
    .map_err(|err| backfill_err(err, household_id, "ensure_checkpoint"))?;
    Ok(())
}

async fn load_checkpoint(
    pool: &SqlitePool,
    household_id: &str,
) -> AppResult<(i64, u64, u64, u64)> {
    let row = sqlx::query(
        "SELECT last_rowid, processed, updated, skipped FROM events_backfill_checkpoint \
         WHERE household_id = ?",
    )
    .bind(household_id)
    .fetch_optional(pool)
    .await
    .map_err(|err| backfill_err(err, household_id, "load_checkpoint"))?;
    Ok(match row {
        Some(row) => (
            row.try_get::<i64, _>("last_rowid").unwrap_or(0),
            row.try_get::<i64, _>("processed").unwrap_or(0) as u64,
            row.try_get::<i64, _>("updated").unwrap_or(0) as u64,
            row.try_get::<i64, _>("skipped").unwrap_or(0) as u64,
        ),
        None => (0, 0, 0, 0),
    })
}

struct Checkpoint {
    last_rowid: i64,
    processed: u64,
    updated: u64,
    skipped: u64,
    total: u64,
}

async fn process_chunk<F>(
    pool: &SqlitePool,
    tzdb: &TzDb,
    options: &BackfillOptions,
    zones: &ResolvedZones,
    after_rowid: i64,
    checkpoint_for: F,
) -> AppResult<ChunkOutcome>
where
    F: Fn(&ChunkOutcome) -> Checkpoint,
{
    let household_id = &options.household_id;
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| backfill_err(err, household_id, "begin_tx"))?;

    let rows = sqlx::query(
        "SELECT rowid, id, start_at, end_at, tz, rrule, start_at_utc, end_at_utc \
         FROM events \
         WHERE household_id = ? AND deleted_at IS NULL AND rowid > ? \
         ORDER BY rowid \
         LIMIT ?",
    )
    .bind(household_id)
    .bind(after_rowid)
    .bind(options.chunk_size as i64)
    .fetch_all(&mut *tx)
    .await
    .map_err(|err| backfill_err(err, household_id, "load_chunk"))?;

    let mut outcome = ChunkOutcome {
        scanned: 0,
        updated: 0,
        skipped: 0,
        last_rowid: after_rowid,
    };

    for row in &rows {
        outcome.scanned += 1;
        outcome.last_rowid = row
            .try_get::<i64, _>("rowid")
            .map_err(|err| backfill_err(err, household_id, "read_rowid"))?;
        let event_id: String = row
            .try_get("id")
            .map_err(|err| backfill_err(err, household_id, "read_id"))?;

        let Some(plan) = plan_row_update(tzdb, zones, &event_id, row) else {
            outcome.skipped += 1;
            continue;
        };
        let Some(plan) = plan else {
            // Already canonical.
            continue;
        };

        if options.dry_run {
            outcome.skipped += 1;
            continue;
        }

        sqlx::query(
            "UPDATE events SET start_at = ?, end_at = ?, tz = ?, start_at_utc = ?, \
             end_at_utc = ?, updated_at = ? WHERE id = ?",
        )
        .bind(plan.start_at)
        .bind(plan.end_at)
        .bind(&plan.tz)
        .bind(plan.start_at_utc)
        .bind(plan.end_at_utc)
        .bind(time::now_ms())
        .bind(&event_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            backfill_err(err, household_id, "update_event").with_context("event_id", event_id)
        })?;
        outcome.updated += 1;
    }

    if !options.dry_run && outcome.scanned > 0 {
        let checkpoint = checkpoint_for(&outcome);
        sqlx::query(
            "INSERT INTO events_backfill_checkpoint \
                 (household_id, last_rowid, processed, updated, skipped, total, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(household_id) DO UPDATE SET \
                 last_rowid = excluded.last_rowid, \
                 processed = excluded.processed, \
                 updated = excluded.updated, \
                 skipped = excluded.skipped, \
                 total = excluded.total, \
                 updated_at = excluded.updated_at",
        )
        .bind(household_id)
        .bind(checkpoint.last_rowid)
        .bind(checkpoint.processed as i64)
        .bind(checkpoint.updated as i64)
        .bind(checkpoint.skipped as i64)
        .bind(checkpoint.total as i64)
        .bind(time::now_ms())
        .execute(&mut *tx)
        .await
        .map_err(|err| backfill_err(err, household_id, "write_checkpoint"))?;
    }

    tx.commit()
        .await
        .map_err(|err| backfill_err(err, household_id, "commit_tx"))?;

    Ok(outcome)
}

struct RowUpdate {
    start_at: i64,
    end_at: Option<i64>,
    tz: String,
    start_at_utc: i64,
    end_at_utc: Option<i64>,
}

/// Decide what a row should look like in canonical form.
///
/// Outer `None` means the row cannot be normalized and must be skipped;
/// inner `None` means the row is already canonical.
fn plan_row_update(
    tzdb: &TzDb,
    zones: &ResolvedZones,
    event_id: &str,
    row: &sqlx::sqlite::SqliteRow,
) -> Option<Option<RowUpdate>> {
    let Some(wall_start) = read_wall_clock(row, "start_at") else {
        warn!(
            target: "kinloch",
            event = "backfill_undecodable_start",
            event_id = %event_id
        );
        return None;
    };
    let wall_end = read_wall_clock(row, "end_at");

    let row_tz: Option<String> = row.try_get("tz").ok();
    let tz = match row_tz.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => match tzdb.resolve(name) {
            Ok(tz) => tz,
            Err(_) => {
                warn!(
                    target: "kinloch",
                    event = "backfill_row_tz_invalid",
                    event_id = %event_id,
                    timezone = %name
                );
                return None;
            }
        },
        None => zones
            .default_tz
            .or(zones.household_tz)
            .unwrap_or(chrono_tz::UTC),
    };

    let Ok(direct_start_utc) = local_ms_to_utc_ms(tz, wall_start) else {
        return None;
    };
    // Round-trip guard: a cache we cannot reproduce from its own wall clock
    // must not be written.
    match utc_ms_to_local_ms(tz, direct_start_utc) {
        Ok(back) if back == wall_start => {}
        _ => {
            warn!(
                target: "kinloch",
                event = "backfill_round_trip_failed",
                event_id = %event_id,
                wall_start = wall_start
            );
            return None;
        }
    }

    let anchor_local = time::naive_from_ms(wall_start).ok()?;
    let rrule: Option<String> = row.try_get("rrule").ok();
    let start_at_utc = match rrule.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => match parse_rule(raw) {
            Ok(rule) => {
                first_occurrence_utc_ms(&rule, anchor_local, tz).unwrap_or(direct_start_utc)
            }
            Err(err) => {
                warn!(
                    target: "kinloch",
                    event = "backfill_rrule_invalid",
                    event_id = %event_id,
                    code = %err.code()
                );
                direct_start_utc
            }
        },
        None => direct_start_utc,
    };
    let end_at_utc = match wall_end {
        Some(end) => Some(local_ms_to_utc_ms(tz, end).ok()?),
        None => None,
    };

    let stored_start: Option<i64> = row.try_get("start_at").ok();
    let stored_end: Option<i64> = row.try_get("end_at").ok();
    let stored_start_utc: Option<i64> = row.try_get("start_at_utc").ok();
    let stored_end_utc: Option<i64> = row.try_get("end_at_utc").ok();
    let tz_name = tz.name().to_string();

    let canonical = stored_start == Some(wall_start)
        && stored_end == wall_end
        && row_tz.as_deref() == Some(tz_name.as_str())
        && stored_start_utc == Some(start_at_utc)
        && stored_end_utc == end_at_utc;
    if canonical {
        return Some(None);
    }

    Some(Some(RowUpdate {
        start_at: wall_start,
        end_at: wall_end,
        tz: tz_name,
        start_at_utc,
        end_at_utc,
    }))
}
