use crate::domain::bar::{DateRange, Ticker};
use crate::ingest::fetch::{fetch_all, FetchOptions, TickerRows};
use crate::ingest::provider::MarketDataClient;
use crate::ingest::throttle::RequestThrottle;
use crate::loader::{load, LoadError, LoadOptions, LoadSummary};
use crate::storage::bars::BarSink;
use crate::storage::tickers::{TickerSource, TickerSourceError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] TickerSourceError),

    #[error("ticker query returned no tickers")]
    NoTickers,

    #[error(transparent)]
    Load(#[from] LoadError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ticker_sql: String,
    pub range: DateRange,
    pub fetch: FetchOptions,
    pub load: LoadOptions,
    /// Fetch and report, but never touch the target table.
    pub dry_run: bool,
}

/// Collaborators for one run. Constructed by the caller; nothing here is global.
pub struct PipelineDeps<'a> {
    pub source: &'a dyn TickerSource,
    pub client: Arc<dyn MarketDataClient>,
    pub throttle: Option<Arc<RequestThrottle>>,
    pub sink: &'a dyn BarSink,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTicker {
    pub ticker: Ticker,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub range: DateRange,
    pub tickers_requested: usize,
    pub fetched: Vec<TickerRows>,
    pub failed: Vec<FailedTicker>,
    pub rows_fetched: usize,
    /// `None` on a dry run.
    pub load: Option<LoadSummary>,
}

impl RunReport {
    /// Per-ticker fetch failures do not count against success.
    pub fn is_success(&self) -> bool {
        self.load.as_ref().map_or(true, LoadSummary::is_complete)
    }
}

/// Ticker source → parallel fetch → chunked load.
pub async fn run(deps: PipelineDeps<'_>, cfg: &PipelineConfig) -> Result<RunReport, PipelineError> {
    let run_id = Uuid::new_v4();
    tracing::info!(%run_id, table = %cfg.load.target_table, dry_run = cfg.dry_run, "run started");

    let tickers = deps.source.get_tickers(&cfg.ticker_sql).await?;
    if tickers.is_empty() {
        return Err(PipelineError::NoTickers);
    }
    tracing::info!(%run_id, tickers = tickers.len(), "fetched ticker list");

    let fetch = fetch_all(deps.client, deps.throttle, &tickers, cfg.range, &cfg.fetch).await;

    let failed: Vec<FailedTicker> = fetch
        .failures
        .iter()
        .map(|f| FailedTicker {
            ticker: f.ticker.clone(),
            kind: f.error.kind(),
            reason: f.error.to_string(),
        })
        .collect();

    tracing::info!(
        %run_id,
        fetched = fetch.fetched.len(),
        failed = failed.len(),
        rows = fetch.dataset.len(),
        "fetch phase done"
    );

    let summary = if cfg.dry_run {
        tracing::info!(%run_id, rows = fetch.dataset.len(), "dry run; skipping load");
        None
    } else {
        Some(load(deps.sink, &fetch.dataset, &cfg.load).await?)
    };

    Ok(RunReport {
        run_id,
        range: cfg.range,
        tickers_requested: tickers.len(),
        rows_fetched: fetch.dataset.len(),
        fetched: fetch.fetched,
        failed,
        load: summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::BatchFailurePolicy;
    use crate::storage::bars::TargetTable;
    use crate::test_support::{range, FakeClient, FakeSink, FakeSource, Script};

    fn config(dry_run: bool) -> PipelineConfig {
        PipelineConfig {
            ticker_sql: "SELECT ticker FROM universe".to_string(),
            range: range(),
            fetch: FetchOptions {
                concurrency: 2,
                task_timeout: None,
            },
            load: LoadOptions {
                target_table: TargetTable::parse("daily_bars").unwrap(),
                chunk_size: 3,
                pre_sql: Some("TRUNCATE daily_bars".to_string()),
                post_sql: None,
                policy: BatchFailurePolicy::StopOnFirst,
            },
            dry_run,
        }
    }

    #[tokio::test]
    async fn not_found_ticker_is_reported_and_the_rest_load() {
        let source = FakeSource::tickers(&["A", "B", "C"]);
        let client = Arc::new(FakeClient::new().script("B", Script::NotFound));
        let sink = FakeSink::default();
        let deps = PipelineDeps {
            source: &source,
            client,
            throttle: None,
            sink: &sink,
        };

        let report = run(deps, &config(false)).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.tickers_requested, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].ticker, "B");
        assert_eq!(report.failed[0].kind, "not_found");

        let loaded: Vec<String> = sink
            .batches()
            .into_iter()
            .flatten()
            .map(|b| b.ticker)
            .collect();
        assert_eq!(loaded, vec!["A", "A", "C", "C"]);
        assert_eq!(report.load.unwrap().rows_loaded, 4);
    }

    #[tokio::test]
    async fn source_failure_stops_before_fetch() {
        let source = FakeSource::failing();
        let client = Arc::new(FakeClient::new());
        let sink = FakeSink::default();
        let deps = PipelineDeps {
            source: &source,
            client: client.clone(),
            throttle: None,
            sink: &sink,
        };

        let err = run(deps, &config(false)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Source(_)));
        assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn zero_tickers_ends_without_load() {
        let source = FakeSource::tickers(&[]);
        let sink = FakeSink::default();
        let deps = PipelineDeps {
            source: &source,
            client: Arc::new(FakeClient::new()),
            throttle: None,
            sink: &sink,
        };

        assert!(matches!(
            run(deps, &config(false)).await,
            Err(PipelineError::NoTickers)
        ));
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_sink() {
        let source = FakeSource::tickers(&["A", "B"]);
        let sink = FakeSink::default();
        let deps = PipelineDeps {
            source: &source,
            client: Arc::new(FakeClient::new()),
            throttle: None,
            sink: &sink,
        };

        let report = run(deps, &config(true)).await.unwrap();

        assert!(report.load.is_none());
        assert_eq!(report.rows_fetched, 4);
        assert!(report.is_success());
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn batch_failure_marks_the_run_unsuccessful() {
        let source = FakeSource::tickers(&["A", "B", "C"]);
        let sink = FakeSink::default().fail_batch(0);
        let deps = PipelineDeps {
            source: &source,
            client: Arc::new(FakeClient::new()),
            throttle: None,
            sink: &sink,
        };

        let report = run(deps, &config(false)).await.unwrap();

        assert!(!report.is_success());
        let load = report.load.unwrap();
        assert_eq!(load.batches_attempted, 1);
        assert_eq!(load.batches_total, 2);
    }

    #[tokio::test]
    async fn report_serializes_to_json() {
        let source = FakeSource::tickers(&["A", "B"]);
        let sink = FakeSink::default();
        let deps = PipelineDeps {
            source: &source,
            client: Arc::new(FakeClient::new().script("B", Script::NotFound)),
            throttle: None,
            sink: &sink,
        };

        let report = run(deps, &config(false)).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["failed"][0]["ticker"], "B");
        assert_eq!(json["failed"][0]["kind"], "not_found");
        assert_eq!(json["load"]["rows_loaded"], 2);
        assert_eq!(json["range"]["from"], "2026-03-02");
    }
}
