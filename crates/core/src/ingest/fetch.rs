use crate::config::Settings;
use crate::domain::bar::{DailyBar, DateRange, Ticker};
use crate::ingest::error::MarketDataError;
use crate::ingest::provider::MarketDataClient;
use crate::ingest::throttle::RequestThrottle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const CONCURRENCY_PER_CPU: usize = 2;
const MAX_LOGGED_FAILURES: usize = 10;
const PROGRESS_EVERY: usize = 200;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Worker pool size; at most this many provider calls are in flight.
    pub concurrency: usize,
    /// Per-ticker deadline. Expiry becomes a `Transport` failure for that ticker only.
    pub task_timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_timeout: None,
        }
    }
}

impl FetchOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings
                .fetch_concurrency
                .filter(|n| *n > 0)
                .unwrap_or_else(default_concurrency),
            task_timeout: settings.fetch_task_timeout_secs.map(Duration::from_secs),
        }
    }
}

pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * CONCURRENCY_PER_CPU
}

#[derive(Debug)]
pub struct FetchFailure {
    pub ticker: Ticker,
    pub error: MarketDataError,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickerRows {
    pub ticker: Ticker,
    pub rows: usize,
}

/// Outcome of a full fan-out: every requested ticker lands in exactly one of
/// `fetched` or `failures`.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub dataset: Vec<DailyBar>,
    pub fetched: Vec<TickerRows>,
    pub failures: Vec<FetchFailure>,
}

/// Fetches every ticker through a bounded pool and waits for all of them.
///
/// Per-ticker errors (including panics inside a task) are captured in
/// `FetchReport::failures`; nothing here aborts the run. Rows are appended in
/// ticker order, each ticker's rows in the order the client returned them.
pub async fn fetch_all(
    client: Arc<dyn MarketDataClient>,
    throttle: Option<Arc<RequestThrottle>>,
    tickers: &[Ticker],
    range: DateRange,
    opts: &FetchOptions,
) -> FetchReport {
    let concurrency = opts.concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    let total = tickers.len();

    tracing::info!(
        provider = client.provider_name(),
        tickers = total,
        concurrency,
        from = %range.from,
        to = %range.to,
        "fetch phase started"
    );

    let mut handles = Vec::with_capacity(total);
    for ticker in tickers {
        let client = Arc::clone(&client);
        let throttle = throttle.clone();
        let permits = Arc::clone(&permits);
        let task_timeout = opts.task_timeout;
        let symbol = ticker.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Err(MarketDataError::TaskFailed("worker pool closed".to_string()));
            };

            if let Some(throttle) = throttle.as_deref() {
                throttle.acquire().await;
            }

            let call = client.fetch_daily(&symbol, range);
            match task_timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(MarketDataError::Transport(format!(
                        "fetch exceeded {}s task timeout",
                        limit.as_secs()
                    )))
                }),
                None => call.await,
            }
        });
        handles.push((ticker.clone(), handle));
    }

    let mut report = FetchReport::default();
    for (idx, (ticker, handle)) in handles.into_iter().enumerate() {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(MarketDataError::TaskFailed(join_err.to_string())),
        };

        match outcome {
            Ok(bars) => {
                report.fetched.push(TickerRows {
                    ticker,
                    rows: bars.len(),
                });
                report.dataset.extend(bars);
            }
            Err(error) => {
                if report.failures.len() < MAX_LOGGED_FAILURES {
                    tracing::warn!(
                        %ticker,
                        kind = error.kind(),
                        error = %error,
                        "ticker fetch failed; skipping"
                    );
                } else {
                    tracing::debug!(%ticker, kind = error.kind(), error = %error, "ticker fetch failed");
                }
                report.failures.push(FetchFailure { ticker, error });
            }
        }

        let n = idx + 1;
        if n == total || n % PROGRESS_EVERY == 0 {
            tracing::info!(
                processed = n,
                total,
                rows = report.dataset.len(),
                failures = report.failures.len(),
                "fetch progress"
            );
        }
    }

    report
}
