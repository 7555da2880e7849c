use crate::domain::bar::DailyBar;
use sqlx::Executor;
use std::fmt;
use thiserror::Error;

/// Bind parameters per inserted row: ticker, date, open, high, low, close, volume.
pub const BAR_COLUMNS: usize = 7;
/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

pub const fn max_chunk_size() -> usize {
    MAX_BIND_PARAMS / BAR_COLUMNS
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid target table name: {0:?}")]
pub struct InvalidTableName(pub String);

/// A validated `table` or `schema.table` name, safe to splice into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable(String);

impl TargetTable {
    pub fn parse(raw: &str) -> Result<Self, InvalidTableName> {
        let name = raw.trim();
        let parts: Vec<&str> = name.split('.').collect();
        let valid = (1..=2).contains(&parts.len()) && parts.iter().all(|p| is_identifier(p));
        if !valid {
            return Err(InvalidTableName(raw.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Write side of the relational store used by the loader.
#[async_trait::async_trait]
pub trait BarSink: Send + Sync {
    /// Runs a free-form statement (pre/post load). Returns rows affected.
    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error>;

    /// Inserts `rows` as one multi-row statement in its own transaction.
    async fn insert_batch(&self, table: &TargetTable, rows: &[DailyBar]) -> Result<u64, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct PgBarSink {
    pool: sqlx::PgPool,
}

impl PgBarSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Reads back every row of `table`, ordered by ticker then date.
    pub async fn read_all(&self, table: &TargetTable) -> Result<Vec<DailyBar>, sqlx::Error> {
        let sql = format!(
            "SELECT ticker, date, open, high, low, close, volume FROM {table} ORDER BY ticker, date"
        );
        let rows = sqlx::query_as::<_, (String, chrono::NaiveDate, f64, f64, f64, f64, i64)>(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(ticker, date, open, high, low, close, volume)| DailyBar {
                ticker,
                date,
                open,
                high,
                low,
                close,
                volume,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl BarSink for PgBarSink {
    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error> {
        // Unprepared on purpose: pre/post hooks may hold several statements.
        let res = (&self.pool).execute(sql).await?;
        Ok(res.rows_affected())
    }

    async fn insert_batch(&self, table: &TargetTable, rows: &[DailyBar]) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let mut qb = sqlx::QueryBuilder::new(format!(
            "INSERT INTO {table} (ticker, date, open, high, low, close, volume) "
        ));
        qb.push_values(rows, |mut b, bar| {
            b.push_bind(bar.ticker.as_str())
                .push_bind(bar.date)
                .push_bind(bar.open)
                .push_bind(bar.high)
                .push_bind(bar.low)
                .push_bind(bar.close)
                .push_bind(bar.volume);
        });

        let res = qb.build().persistent(false).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(res.rows_affected())
    }
}
