use crate::domain::bar::Ticker;
use sqlx::Row;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickerSourceError {
    /// The query could not run: connection, permissions, or SQL error.
    #[error("ticker query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("ticker query's first column is not text: {0}")]
    Column(#[source] sqlx::Error),
}

#[async_trait::async_trait]
pub trait TickerSource: Send + Sync {
    async fn get_tickers(&self, query: &str) -> Result<Vec<Ticker>, TickerSourceError>;
}

#[derive(Debug, Clone)]
pub struct PgTickerSource {
    pool: sqlx::PgPool,
}

impl PgTickerSource {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TickerSource for PgTickerSource {
    async fn get_tickers(&self, query: &str) -> Result<Vec<Ticker>, TickerSourceError> {
        let rows = sqlx::query(query)
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(TickerSourceError::Query)?;

        let raw = rows
            .iter()
            .map(|row| row.try_get::<Option<String>, _>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(TickerSourceError::Column)?;

        let tickers = normalize_tickers(raw);
        tracing::info!(rows = rows.len(), tickers = tickers.len(), "ticker source query done");
        Ok(tickers)
    }
}

/// Trims, drops NULL/blank values and keeps the first occurrence of each symbol.
pub fn normalize_tickers<I>(raw: I) -> Vec<Ticker>
where
    I: IntoIterator<Item = Option<String>>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
