use crate::domain::bar::DailyBar;
use crate::ingest::error::MarketDataError;
use chrono::NaiveDate;
use serde::Deserialize;

/// One element of the provider's `/eod/{symbol}` JSON array. Unknown fields
/// (`adjusted_close`, ...) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct EodBarRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    // Some feeds emit volume as a float (`1234.0`).
    pub volume: f64,
}

impl EodBarRow {
    pub fn into_bar(self, ticker: &str) -> DailyBar {
        DailyBar {
            ticker: ticker.to_string(),
            date: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume.round() as i64,
        }
    }
}

/// Parses a provider body into bars for `ticker`, sorted by date.
pub fn parse_eod_body(ticker: &str, body: &str) -> Result<Vec<DailyBar>, MarketDataError> {
    let rows = serde_json::from_str::<Vec<EodBarRow>>(body).map_err(|err| {
        MarketDataError::InvalidResponse(format!("{err}; body={}", excerpt(body)))
    })?;

    let mut bars: Vec<DailyBar> = rows.into_iter().map(|row| row.into_bar(ticker)).collect();
    bars.sort_by_key(|bar| bar.date);
    Ok(bars)
}

pub(crate) fn excerpt(body: &str) -> String {
    const MAX_CHARS: usize = 200;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_CHARS).collect();
    out.push_str("...");
    out
}
