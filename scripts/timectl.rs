use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use kinloch::{
    backfill::{
        run_events_backfill, BackfillControl, BackfillOptions, BackfillProgress, BackfillStatus,
        BackfillSummary, MAX_CHUNK_SIZE, MAX_PROGRESS_INTERVAL_MS, MIN_CHUNK_SIZE,
        MIN_PROGRESS_INTERVAL_MS,
    },
    drift::{self, DriftCheckOptions},
    logging,
    tz::TzDb,
    AppError,
};
use serde_json::json;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous},
    ConnectOptions, SqlitePool,
};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "timectl", about = "Timekeeping maintenance utilities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run the timezone backfill with progress reporting")]
    Backfill(BackfillArgs),
    #[command(about = "Check cached UTC instants against fresh conversions")]
    Drift(DriftArgs),
}

#[derive(Args)]
struct BackfillArgs {
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    #[arg(long, value_name = "HOUSEHOLD")]
    household: String,

    #[arg(long, value_name = "TZ")]
    default_tz: Option<String>,

    #[arg(long, value_name = "N", default_value_t = 500)]
    chunk_size: usize,

    #[arg(long, value_name = "MS")]
    progress_interval: Option<u64>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    resume: bool,

    #[arg(long)]
    json_summary: bool,
}

#[derive(Args)]
struct DriftArgs {
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    #[arg(long, value_name = "PATH", default_value = "drift-report.json")]
    output: PathBuf,

    #[arg(long, value_name = "HOUSEHOLD")]
    household: Option<String>,

    #[arg(long, value_name = "MS", default_value_t = drift::DEFAULT_TOLERANCE_MS)]
    tolerance: i64,

    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Backfill(args) => run_backfill(args).await?,
        Command::Drift(args) => run_drift(args).await?,
    }

    Ok(())
}

async fn run_backfill(args: BackfillArgs) -> Result<()> {
    let pool = open_pool(&args.db).await?;
    let tzdb = TzDb::bundled();

    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&args.chunk_size) {
        anyhow::bail!(
            "Chunk size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} rows per batch."
        );
    }
    if let Some(interval) = args.progress_interval {
        if interval != 0
            && !(MIN_PROGRESS_INTERVAL_MS..=MAX_PROGRESS_INTERVAL_MS).contains(&interval)
        {
            anyhow::bail!(
                "Progress interval must be between {MIN_PROGRESS_INTERVAL_MS} and {MAX_PROGRESS_INTERVAL_MS} milliseconds."
            );
        }
    }

    let control = BackfillControl::new();
    let progress_cb: Arc<dyn Fn(BackfillProgress) + Send + Sync> = Arc::new(|progress| {
        let event = json!({
            "type": "progress",
            "household_id": progress.household_id,
            "scanned": progress.scanned,
            "updated": progress.updated,
            "skipped": progress.skipped,
            "remaining": progress.remaining,
            "elapsed_ms": progress.elapsed_ms,
            "chunk_size": progress.chunk_size,
        });
        println!("{}", event);
        info!(
            target: "kinloch::backfill",
            household_id = %progress.household_id,
            scanned = progress.scanned,
            updated = progress.updated,
            skipped = progress.skipped,
            remaining = progress.remaining,
            elapsed_ms = progress.elapsed_ms,
            chunk_size = progress.chunk_size,
            "progress"
        );
    });

    let backfill_future = run_events_backfill(
        &pool,
        &tzdb,
        BackfillOptions {
            household_id: args.household.clone(),
            default_tz: args.default_tz.clone(),
            chunk_size: args.chunk_size,
            progress_interval_ms: args.progress_interval.unwrap_or(0),
            dry_run: args.dry_run,
            reset_checkpoint: !args.resume,
        },
        Some(control.clone()),
        Some(progress_cb),
        None,
    );

    tokio::pin!(backfill_future);
    let summary_result = loop {
        tokio::select! {
            result = &mut backfill_future => break result,
            signal = signal::ctrl_c() => {
                signal.expect("install Ctrl+C handler");
                if !control.is_cancelled() {
                    eprintln!("Received interrupt. Finishing current chunk before exiting…");
                    control.cancel();
                }
            }
        }
    };

    let summary = summary_result.map_err(|err| anyhow!(format_cli_error(&err)))?;
    emit_summary_event(&summary);
    if !args.json_summary {
        print_human_summary(&summary);
    }

    let exit_code = match summary.status {
        BackfillStatus::Completed => 0,
        BackfillStatus::Cancelled => 130,
        BackfillStatus::Failed => 1,
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}

async fn run_drift(args: DriftArgs) -> Result<()> {
    let pool = open_pool(&args.db).await?;
    let tzdb = TzDb::bundled();
    let options = DriftCheckOptions {
        household_id: args.household.clone(),
        tolerance_ms: args.tolerance,
    };
    let started = Instant::now();
    let report = drift::run_drift_check(&pool, &tzdb, options)
        .await
        .map_err(|err| anyhow!(err.to_string()))?;
    let elapsed = started.elapsed();

    println!("{}", drift::format_human_summary(&report));
    if report.drift_events.is_empty() {
        println!("No drift detected (0 offending events)");
    } else {
        println!(
            "Drift detected ({} offending events)",
            report.drift_events.len()
        );
    }
    println!("Elapsed: {:.2}s", elapsed.as_secs_f64());

    let json = if args.pretty {
        serde_json::to_vec_pretty(&report.drift_events)?
    } else {
        serde_json::to_vec(&report.drift_events)?
    };
    std::fs::write(&args.output, &json)
        .with_context(|| format!("write {}", args.output.display()))?;
    eprintln!(
        "Wrote {} drift events to {}",
        report.drift_events.len(),
        args.output.display()
    );

    if !report.drift_events.is_empty() {
        std::process::exit(2);
    }

    Ok(())
}

fn emit_summary_event(summary: &BackfillSummary) {
    let event = json!({
        "type": "summary",
        "household_id": summary.household_id,
        "scanned": summary.total_scanned,
        "updated": summary.total_updated,
        "skipped": summary.total_skipped,
        "elapsed_ms": summary.elapsed_ms,
        "status": summary.status,
    });
    println!("{}", event);
}

fn print_human_summary(summary: &BackfillSummary) {
    eprintln!("\nSummary ({})", format_status(&summary.status));
    eprintln!("  Household: {}", summary.household_id);
    eprintln!("  Scanned:   {}", summary.total_scanned);
    eprintln!("  Updated:   {}", summary.total_updated);
    eprintln!("  Skipped:   {}", summary.total_skipped);
    eprintln!("  Elapsed:   {:.2}s", summary.elapsed_ms as f64 / 1000.0);
    eprintln!();
}

fn format_status(status: &BackfillStatus) -> &'static str {
    match status {
        BackfillStatus::Completed => "completed",
        BackfillStatus::Cancelled => "cancelled",
        BackfillStatus::Failed => "failed",
    }
}

async fn open_pool(db: &std::path::Path) -> Result<SqlitePool> {
    if !db.exists() {
        anyhow::bail!("database not found: {}", db.display());
    }
    let opts = SqliteConnectOptions::new()
        .filename(db)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);
    let pool = SqlitePool::connect_with(opts)
        .await
        .with_context(|| format!("open {}", db.display()))?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&pool)
        .await
        .ok();
    sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
        .execute(&pool)
        .await
        .ok();
    Ok(pool)
}

fn format_cli_error(err: &AppError) -> String {
    match err.code() {
        "BACKFILL/INVALID_TIMEZONE" => {
            if let Some(tz) = err.context().get("timezone") {
                return format!("Invalid timezone '{tz}'. Use an IANA zone like 'Europe/London'.");
            }
            format!("{} Use an IANA zone like 'Europe/London'.", err.message())
        }
        "BACKFILL/INVALID_CHUNK_SIZE" => {
            let range = format!("{MIN_CHUNK_SIZE}-{MAX_CHUNK_SIZE}");
            if let Some(value) = err.context().get("chunk_size") {
                return format!("Chunk size {value} is outside the supported range ({range}).");
            }
            format!("{} (allowed range: {range})", err.message())
        }
        "BACKFILL/INVALID_PROGRESS_INTERVAL" => {
            let range = format!("{MIN_PROGRESS_INTERVAL_MS}-{MAX_PROGRESS_INTERVAL_MS}");
            if let Some(value) = err.context().get("progress_interval") {
                return format!(
                    "Progress interval {value}ms is outside the supported range ({range}ms)."
                );
            }
            format!("{} (allowed range: {range}ms)", err.message())
        }
        _ => err.to_string(),
    }
}
