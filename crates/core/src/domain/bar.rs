use anyhow::ensure;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

pub type Ticker = String;

/// One end-of-day row. `(ticker, date)` is unique within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Inclusive calendar range requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> anyhow::Result<Self> {
        ensure!(from <= to, "date range start {from} is after end {to}");
        Ok(Self { from, to })
    }

    /// `lookback_days` calendar days ending at (and including) `to`.
    pub fn ending_at(to: NaiveDate, lookback_days: u32) -> Self {
        let span = i64::from(lookback_days.max(1)) - 1;
        Self {
            from: to - Duration::days(span),
            to,
        }
    }
}
