use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use kinloch::{
    backfill::{
        run_events_backfill, BackfillControl, BackfillOptions, BackfillProgress, BackfillStatus,
        ChunkObserver, ProgressCallback,
    },
    migrate,
    tz::TzDb,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::Row;
use tempfile::tempdir;
use tokio::time::timeout;

type SqlitePool = sqlx::SqlitePool;

async fn setup_pool(path: &std::path::Path) -> Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_opts)
        .await?;

    migrate::apply_migrations(&pool).await?;

    sqlx::query("INSERT INTO household (id, name, tz) VALUES ('hh', 'Household', NULL)")
        .execute(&pool)
        .await?;

    Ok(pool)
}

async fn seed_events(pool: &SqlitePool, count: usize) -> Result<()> {
    let base_ts = 1_700_000_000_000i64;
    for idx in 0..count {
        let id = format!("evt-{idx:04}");
        let start_at = base_ts + (idx as i64) * 3_600_000;
        let end_at = if idx % 2 == 0 {
            Some(start_at + 3_600_000)
        } else {
            None
        };
        sqlx::query(
            "INSERT INTO events (id, household_id, title, start_at, end_at, created_at, updated_at) \
             VALUES (?1, 'hh', ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&id)
        .bind(format!("Event {idx}"))
        .bind(start_at)
        .bind(end_at)
        .bind(start_at)
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn default_options() -> BackfillOptions {
    BackfillOptions {
        household_id: "hh".to_string(),
        default_tz: Some("UTC".to_string()),
        chunk_size: 100,
        progress_interval_ms: 0,
        dry_run: false,
        reset_checkpoint: false,
    }
}

fn ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

#[tokio::test]
async fn resumes_after_panic_and_persists_progress() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;
    seed_events(&pool, 150).await?;

    let panic_once = Arc::new(AtomicBool::new(true));
    let observer_flag = panic_once.clone();
    let observer: ChunkObserver = Arc::new(move |stats| {
        if stats.chunk_index == 1 && observer_flag.swap(false, Ordering::SeqCst) {
            panic!("simulated crash after first chunk");
        }
    });

    let pool_for_task = pool.clone();
    let handle = tokio::spawn(async move {
        let tzdb = TzDb::bundled();
        let _ = run_events_backfill(
            &pool_for_task,
            &tzdb,
            default_options(),
            Some(BackfillControl::new()),
            None,
            Some(observer),
        )
        .await;
    });

    let join_result = timeout(Duration::from_secs(20), handle)
        .await
        .expect("backfill task should complete within timeout");
    let err = join_result.expect_err("backfill task should propagate panic");
    assert!(err.is_panic(), "expected panic join error");

    let checkpoint_row = sqlx::query(
        "SELECT processed, updated, skipped, total, last_rowid \
         FROM events_backfill_checkpoint WHERE household_id='hh'",
    )
    .fetch_one(&pool)
    .await?;
    let processed: i64 = checkpoint_row.get("processed");
    let updated: i64 = checkpoint_row.get("updated");
    let last_rowid: i64 = checkpoint_row.get("last_rowid");
    assert_eq!(processed, 100, "processed rows should match chunk size");
    assert_eq!(updated, 100);
    assert!(last_rowid >= 100);

    let updated_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE start_at_utc IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    assert_eq!(updated_count, 100, "only first chunk should be persisted");

    let tzdb = TzDb::bundled();
    let summary = run_events_backfill(
        &pool,
        &tzdb,
        default_options(),
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;

    assert_eq!(summary.status, BackfillStatus::Completed);
    assert_eq!(summary.total_scanned, 50);
    assert_eq!(summary.total_updated, 50);
    assert_eq!(summary.total_skipped, 0);

    let final_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE start_at_utc IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    assert_eq!(final_count, 150);

    let tz_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE tz='UTC'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(tz_count, 150, "fallback timezone should be applied");

    Ok(())
}

#[tokio::test]
async fn dry_run_leaves_rows_and_checkpoint_untouched() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;
    seed_events(&pool, 25).await?;

    let mut options = default_options();
    options.dry_run = true;

    let tzdb = TzDb::bundled();
    let summary = run_events_backfill(
        &pool,
        &tzdb,
        options,
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;

    assert_eq!(summary.status, BackfillStatus::Completed);
    assert_eq!(summary.total_updated, 0);
    assert_eq!(summary.total_skipped, 25);

    let updated_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE start_at_utc IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    assert_eq!(updated_count, 0, "dry run should not persist changes");

    let checkpoint_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM events_backfill_checkpoint WHERE household_id='hh'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(checkpoint_rows, 0, "dry run should not write checkpoints");

    Ok(())
}

#[tokio::test]
async fn cancel_between_chunks_persists_checkpoint_and_resumes() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;
    seed_events(&pool, 240).await?;

    let mut options = default_options();
    options.chunk_size = 80;
    let resume_options = options.clone();

    let control = BackfillControl::new();
    let cancel_once = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel_once.clone();
    let control_for_observer = control.clone();
    let chunk_observer: ChunkObserver = Arc::new(move |stats| {
        if stats.chunk_index >= 2 && !cancel_flag.swap(true, Ordering::SeqCst) {
            control_for_observer.cancel();
        }
    });

    let progress_log: Arc<Mutex<Vec<(u64, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = progress_log.clone();
    let progress_cb: ProgressCallback = Arc::new(move |progress: BackfillProgress| {
        let mut guard = progress_sink.lock().unwrap();
        guard.push((progress.scanned, progress.updated, progress.elapsed_ms));
    });

    let tzdb = TzDb::bundled();
    let summary = run_events_backfill(
        &pool,
        &tzdb,
        options,
        Some(control.clone()),
        Some(progress_cb),
        Some(chunk_observer),
    )
    .await?;

    assert_eq!(summary.status, BackfillStatus::Cancelled);
    assert_eq!(summary.total_updated, 160, "two chunks before the cancel");

    let checkpoint_row = sqlx::query(
        "SELECT processed, total, last_rowid FROM events_backfill_checkpoint \
         WHERE household_id='hh'",
    )
    .fetch_one(&pool)
    .await?;
    let processed: i64 = checkpoint_row.get("processed");
    let total: i64 = checkpoint_row.get("total");
    let last_rowid: i64 = checkpoint_row.get("last_rowid");
    assert!(processed > 0 && processed < total);
    assert!(last_rowid > 0);

    {
        let samples = progress_log.lock().unwrap();
        assert!(!samples.is_empty(), "progress callback should fire");
        for window in samples.windows(2) {
            assert!(window[1].0 >= window[0].0);
            assert!(window[1].1 >= window[0].1);
            assert!(window[1].2 >= window[0].2);
        }
    }

    let resume_summary = run_events_backfill(
        &pool,
        &tzdb,
        resume_options,
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;

    assert_eq!(resume_summary.status, BackfillStatus::Completed);
    assert_eq!(resume_summary.total_updated, 80);

    let final_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE start_at_utc IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    assert_eq!(final_count, 240);

    Ok(())
}

#[tokio::test]
async fn legacy_encodings_normalize_to_canonical_epoch_ms() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;

    let wall = ms(2024, 3, 8, 9);
    // Canonical ms, epoch seconds, and an ISO text value for the same
    // wall-clock time. SQLite stores whatever is bound.
    sqlx::query(
        "INSERT INTO events (id, household_id, title, start_at, created_at, updated_at) \
         VALUES ('ms', 'hh', 'Millis', ?, 0, 0)",
    )
    .bind(wall)
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO events (id, household_id, title, start_at, created_at, updated_at) \
         VALUES ('sec', 'hh', 'Seconds', ?, 0, 0)",
    )
    .bind(wall / 1000)
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO events (id, household_id, title, start_at, created_at, updated_at) \
         VALUES ('iso', 'hh', 'Text', ?, 0, 0)",
    )
    .bind("2024-03-08T09:00:00")
    .execute(&pool)
    .await?;

    let mut options = default_options();
    options.default_tz = Some("America/New_York".to_string());

    let tzdb = TzDb::bundled();
    let summary = run_events_backfill(
        &pool,
        &tzdb,
        options.clone(),
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;
    assert_eq!(summary.status, BackfillStatus::Completed);
    assert_eq!(summary.total_updated, 3);

    // All three encode the same 09:00 EST wall clock, so the same 14:00Z.
    let rows = sqlx::query("SELECT id, start_at, start_at_utc, tz FROM events ORDER BY id")
        .fetch_all(&pool)
        .await?;
    for row in rows {
        let start_at: i64 = row.get("start_at");
        let start_at_utc: i64 = row.get("start_at_utc");
        let tz: String = row.get("tz");
        assert_eq!(start_at, wall);
        assert_eq!(start_at_utc, ms(2024, 3, 8, 14));
        assert_eq!(tz, "America/New_York");
    }

    // A second run over canonical rows changes nothing.
    options.reset_checkpoint = true;
    let second = run_events_backfill(
        &pool,
        &tzdb,
        options,
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;
    assert_eq!(second.status, BackfillStatus::Completed);
    assert_eq!(second.total_scanned, 3);
    assert_eq!(second.total_updated, 0);
    assert_eq!(second.total_skipped, 0);

    Ok(())
}

#[tokio::test]
async fn recurring_rows_cache_their_first_occurrence() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;

    // Weekly on Wednesday, anchored on a Monday: the cache must hold the
    // Wednesday instant, not the anchor's.
    sqlx::query(
        "INSERT INTO events (id, household_id, title, start_at, tz, rrule, created_at, updated_at) \
         VALUES ('e1', 'hh', 'Weekly', ?, 'UTC', 'FREQ=WEEKLY;BYDAY=WE;COUNT=4', 0, 0)",
    )
    .bind(ms(2024, 1, 1, 9))
    .execute(&pool)
    .await?;

    let tzdb = TzDb::bundled();
    let summary = run_events_backfill(
        &pool,
        &tzdb,
        default_options(),
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;
    assert_eq!(summary.total_updated, 1);

    let start_at_utc: i64 = sqlx::query_scalar("SELECT start_at_utc FROM events WHERE id='e1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(start_at_utc, ms(2024, 1, 3, 9));

    Ok(())
}

#[tokio::test]
async fn invalid_row_zone_is_skipped_and_counted() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;

    sqlx::query(
        "INSERT INTO events (id, household_id, title, start_at, tz, created_at, updated_at) \
         VALUES ('bad', 'hh', 'Broken', ?, 'Not/AZone', 0, 0)",
    )
    .bind(ms(2024, 3, 8, 9))
    .execute(&pool)
    .await?;
    seed_events(&pool, 2).await?;

    let tzdb = TzDb::bundled();
    let summary = run_events_backfill(
        &pool,
        &tzdb,
        default_options(),
        Some(BackfillControl::new()),
        None,
        None,
    )
    .await?;

    assert_eq!(summary.status, BackfillStatus::Completed);
    assert_eq!(summary.total_scanned, 3);
    assert_eq!(summary.total_updated, 2);
    assert_eq!(summary.total_skipped, 1);

    let bad_cache: Option<i64> =
        sqlx::query_scalar("SELECT start_at_utc FROM events WHERE id='bad'")
            .fetch_one(&pool)
            .await?;
    assert!(bad_cache.is_none(), "skipped row must stay untouched");

    Ok(())
}

#[tokio::test]
async fn unknown_fallback_zone_fails_upfront() -> Result<()> {
    let tmp = tempdir()?;
    let db_path = tmp.path().join("events.sqlite");
    let pool = setup_pool(&db_path).await?;

    let mut options = default_options();
    options.default_tz = Some("Atlantis/Sunken_City".to_string());

    let tzdb = TzDb::bundled();
    let err = run_events_backfill(&pool, &tzdb, options, None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BACKFILL/INVALID_TIMEZONE");

    Ok(())
}
