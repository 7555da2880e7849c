//! In-memory stand-ins for the provider and the relational store.

use crate::domain::bar::{DailyBar, DateRange, Ticker};
use crate::ingest::error::MarketDataError;
use crate::ingest::provider::MarketDataClient;
use crate::storage::bars::{BarSink, TargetTable};
use crate::storage::tickers::{TickerSource, TickerSourceError};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn range() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
        NaiveDate::from_ymd_opt(2026, 3, 6).unwrap(),
    )
    .unwrap()
}

pub(crate) fn bar(ticker: &str, day: u32) -> DailyBar {
    let base = 100.0 + f64::from(day);
    DailyBar {
        ticker: ticker.to_string(),
        date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
        open: base,
        high: base + 1.5,
        low: base - 1.25,
        close: base + 0.5,
        volume: 1_000 * i64::from(day),
    }
}

/// `per_ticker` consecutive days for each ticker, ticker-major.
pub(crate) fn bars_for(tickers: &[&str], per_ticker: u32) -> Vec<DailyBar> {
    tickers
        .iter()
        .flat_map(|t| (1..=per_ticker).map(move |day| bar(t, day)))
        .collect()
}

pub(crate) enum Script {
    Bars(Vec<DailyBar>),
    NotFound,
    Panic,
    Delay(Duration),
}

/// Unscripted tickers return two bars (2nd and 3rd of the month).
pub(crate) struct FakeClient {
    scripts: HashMap<String, Script>,
    delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(mut self, ticker: &str, script: Script) -> Self {
        self.scripts.insert(ticker.to_string(), script);
        self
    }
}

#[async_trait::async_trait]
impl MarketDataClient for FakeClient {
    fn provider_name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_daily(
        &self,
        ticker: &str,
        _range: DateRange,
    ) -> Result<Vec<DailyBar>, MarketDataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let out = match self.scripts.get(ticker) {
            Some(Script::Bars(bars)) => Ok(bars.clone()),
            Some(Script::NotFound) => Err(MarketDataError::NotFound),
            Some(Script::Panic) => panic!("scripted panic for {ticker}"),
            Some(Script::Delay(extra)) => {
                tokio::time::sleep(*extra).await;
                Ok(vec![bar(ticker, 2), bar(ticker, 3)])
            }
            None => Ok(vec![bar(ticker, 2), bar(ticker, 3)]),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

pub(crate) struct FakeSource {
    tickers: Option<Vec<Ticker>>,
}

impl FakeSource {
    pub fn tickers(names: &[&str]) -> Self {
        Self {
            tickers: Some(names.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn failing() -> Self {
        Self { tickers: None }
    }
}

#[async_trait::async_trait]
impl TickerSource for FakeSource {
    async fn get_tickers(&self, _query: &str) -> Result<Vec<Ticker>, TickerSourceError> {
        self.tickers.clone().ok_or_else(|| {
            TickerSourceError::Query(sqlx::Error::Protocol("relation \"universe\" does not exist".to_string()))
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SinkCall {
    Execute(String),
    Insert(Vec<DailyBar>),
}

/// Records successful calls in order; failures are injected by batch index
/// or by statement prefix.
#[derive(Default)]
pub(crate) struct FakeSink {
    calls: Mutex<Vec<SinkCall>>,
    insert_attempts: AtomicUsize,
    fail_batch: Option<usize>,
    fail_execute_prefix: Option<String>,
}

impl FakeSink {
    pub fn fail_batch(mut self, index: usize) -> Self {
        self.fail_batch = Some(index);
        self
    }

    pub fn fail_execute(mut self, prefix: &str) -> Self {
        self.fail_execute_prefix = Some(prefix.to_string());
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<Vec<DailyBar>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Insert(rows) => Some(rows),
                SinkCall::Execute(_) => None,
            })
            .collect()
    }

    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BarSink for FakeSink {
    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error> {
        if let Some(prefix) = &self.fail_execute_prefix {
            if sql.starts_with(prefix.as_str()) {
                return Err(sqlx::Error::Protocol(format!("statement rejected: {sql}")));
            }
        }
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Execute(sql.to_string()));
        Ok(0)
    }

    async fn insert_batch(&self, _table: &TargetTable, rows: &[DailyBar]) -> Result<u64, sqlx::Error> {
        let index = self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch == Some(index) {
            return Err(sqlx::Error::Protocol("deadlock detected".to_string()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Insert(rows.to_vec()));
        Ok(rows.len() as u64)
    }
}
