use anyhow::Context;
use clap::Parser;
use eodsync_core::config::Settings;
use eodsync_core::domain::bar::DateRange;
use eodsync_core::ingest::fetch::FetchOptions;
use eodsync_core::ingest::provider::{EodhdClient, MarketDataClient};
use eodsync_core::ingest::throttle::RequestThrottle;
use eodsync_core::loader::LoadOptions;
use eodsync_core::pipeline::{self, PipelineConfig, PipelineDeps, PipelineError, RunReport};
use eodsync_core::storage::bars::PgBarSink;
use eodsync_core::storage::lock::RunLock;
use eodsync_core::storage::tickers::PgTickerSource;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "eodsync_worker")]
struct Args {
    /// First date to fetch (YYYY-MM-DD). Defaults to FETCH_LOOKBACK_DAYS before --to.
    #[arg(long)]
    from: Option<String>,

    /// Last date to fetch (YYYY-MM-DD). Defaults to today's UTC date.
    #[arg(long)]
    to: Option<String>,

    /// Fetch and report, but skip every database write.
    #[arg(long)]
    dry_run: bool,

    /// Create the default daily_bars table before running.
    #[arg(long)]
    migrate: bool,

    /// Override FETCH_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override LOAD_CHUNK_SIZE.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    report_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    match run(args, settings).await {
        Ok(code) => Ok(code),
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %format!("{err:#}"), "eodsync run failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(args: Args, settings: Settings) -> anyhow::Result<ExitCode> {
    let range = resolve_range(
        args.from.as_deref(),
        args.to.as_deref(),
        settings.fetch_lookback_days,
    )?;

    let mut fetch = FetchOptions::from_settings(&settings);
    if let Some(n) = args.concurrency {
        anyhow::ensure!(n >= 1, "--concurrency must be >= 1");
        fetch.concurrency = n;
    }

    let mut load = LoadOptions::from_settings(&settings)?;
    if let Some(n) = args.chunk_size {
        load.chunk_size = n;
    }

    let cfg = PipelineConfig {
        ticker_sql: settings.require_ticker_sql()?.to_string(),
        range,
        fetch,
        load,
        dry_run: args.dry_run,
    };

    let client: Arc<dyn MarketDataClient> = Arc::new(EodhdClient::from_settings(&settings)?);
    let throttle = RequestThrottle::new(settings.requests_per_sec).map(Arc::new);
    tracing::info!(
        requests_per_sec = settings.requests_per_sec,
        concurrency = cfg.fetch.concurrency,
        chunk_size = cfg.load.chunk_size,
        "worker configured"
    );

    let pool = eodsync_core::storage::connect(&settings).await?;

    if args.migrate && !args.dry_run {
        eodsync_core::storage::migrate(&pool).await?;
    }

    let lock = if args.dry_run {
        None
    } else {
        match RunLock::try_acquire(&pool, &cfg.load.target_table).await? {
            Some(lock) => Some(lock),
            None => {
                tracing::warn!(
                    table = %cfg.load.target_table,
                    "run lock not acquired; another load of this table is in progress"
                );
                return Ok(ExitCode::FAILURE);
            }
        }
    };

    let source = PgTickerSource::new(pool.clone());
    let sink = PgBarSink::new(pool.clone());
    let deps = PipelineDeps {
        source: &source,
        client,
        throttle,
        sink: &sink,
    };

    let outcome = pipeline::run(deps, &cfg).await;

    if let Some(lock) = lock {
        if let Err(err) = lock.release().await {
            tracing::warn!(error = %err, "failed to release run lock");
        }
    }

    let report = match outcome {
        Ok(report) => report,
        Err(PipelineError::NoTickers) => {
            tracing::warn!("no tickers to process; nothing loaded");
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err).context("pipeline aborted"),
    };

    log_report(&report);
    if args.report_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize run report")?
        );
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn log_report(report: &RunReport) {
    for failed in &report.failed {
        tracing::warn!(
            run_id = %report.run_id,
            ticker = %failed.ticker,
            kind = failed.kind,
            reason = %failed.reason,
            "ticker not loaded"
        );
    }

    match &report.load {
        Some(load) => {
            if let Some(abort) = load.abort_point() {
                tracing::error!(
                    run_id = %report.run_id,
                    batch_index = abort.batch_index,
                    start_row = abort.start_row,
                    end_row = abort.end_row,
                    reason = %abort.reason,
                    "load aborted"
                );
            }
            tracing::info!(
                run_id = %report.run_id,
                tickers_requested = report.tickers_requested,
                tickers_fetched = report.fetched.len(),
                tickers_failed = report.failed.len(),
                rows_fetched = report.rows_fetched,
                rows_loaded = load.rows_loaded,
                batch_failures = load.batch_failures.len(),
                post_load_ran = load.post_load_ran,
                "run finished"
            );
        }
        None => {
            tracing::info!(
                run_id = %report.run_id,
                tickers_requested = report.tickers_requested,
                tickers_fetched = report.fetched.len(),
                tickers_failed = report.failed.len(),
                rows_fetched = report.rows_fetched,
                dry_run = true,
                "run finished"
            );
        }
    }
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

fn resolve_range(
    from: Option<&str>,
    to: Option<&str>,
    lookback_days: u32,
) -> anyhow::Result<DateRange> {
    let to = match to {
        Some(s) => parse_date(s, "--to")?,
        None => chrono::Utc::now().date_naive(),
    };
    match from {
        Some(s) => DateRange::new(parse_date(s, "--from")?, to),
        None => Ok(DateRange::ending_at(to, lookback_days)),
    }
}

fn parse_date(s: &str, flag: &str) -> anyhow::Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("{flag} must be YYYY-MM-DD (got {s:?})"))
}
