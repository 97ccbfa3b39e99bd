/// Install the tracing subscriber for binaries and ad-hoc diagnostics:
/// JSON lines with UTC timestamps, filtered via `KINLOCH_LOG`, with `log`
/// records bridged into `tracing`. Safe to call more than once.
pub fn init() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("KINLOCH_LOG").unwrap_or_else(|_| "kinloch=info,sqlx=warn".into()),
        )
        .json()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .try_init();
}
