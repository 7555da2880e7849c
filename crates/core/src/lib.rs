pub mod domain;
pub mod ingest;
pub mod loader;
pub mod pipeline;
pub mod storage;

#[cfg(test)]
mod test_support;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;

    const DEFAULT_MARKET_DATA_BASE_URL: &str = "https://eodhd.com/api";
    const DEFAULT_TOKEN_RESOURCE: &str = "https://ossrdbms-aad.database.windows.net";
    const DEFAULT_MARKET_DATA_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_REQUESTS_PER_SEC: u32 = 8;
    const DEFAULT_LOOKBACK_DAYS: u32 = 7;
    const DEFAULT_CHUNK_SIZE: usize = 5_000;
    const DEFAULT_DB_MAX_CONNECTIONS: u32 = 2;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub db_server: Option<String>,
        pub db_name: Option<String>,
        pub db_user: Option<String>,
        pub db_access_token: Option<String>,
        pub db_token_source: Option<String>,
        pub db_token_resource: String,
        pub azure_client_id: Option<String>,
        pub db_max_connections: u32,

        pub target_table: Option<String>,
        pub ticker_sql: Option<String>,
        pub pre_load_sql: Option<String>,
        pub post_load_sql: Option<String>,

        pub market_data_api_token: Option<String>,
        pub market_data_base_url: String,
        pub market_data_token_header: Option<String>,
        pub market_data_timeout_secs: u64,

        pub fetch_task_timeout_secs: Option<u64>,
        pub fetch_concurrency: Option<usize>,
        pub requests_per_sec: u32,
        pub fetch_lookback_days: u32,

        pub load_chunk_size: usize,
        pub load_continue_on_error: bool,

        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        /// Builds settings from an arbitrary key lookup. Blank values count as unset.
        pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
        where
            F: Fn(&str) -> Option<String>,
        {
            let var = |key: &str| {
                lookup(key)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };

            Ok(Self {
                database_url: var("DATABASE_URL"),
                db_server: var("DB_SERVER"),
                db_name: var("DB_NAME"),
                db_user: var("DB_USER"),
                db_access_token: var("DB_ACCESS_TOKEN"),
                db_token_source: var("DB_TOKEN_SOURCE"),
                db_token_resource: var("DB_TOKEN_RESOURCE")
                    .unwrap_or_else(|| DEFAULT_TOKEN_RESOURCE.to_string()),
                azure_client_id: var("AZURE_CLIENT_ID"),
                db_max_connections: parse_var(&var, "DB_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),

                target_table: var("TARGET_TABLE"),
                ticker_sql: var("TICKER_SQL"),
                pre_load_sql: var("PRE_LOAD_SQL"),
                post_load_sql: var("POST_LOAD_SQL"),

                market_data_api_token: var("EODHD_API_TOKEN"),
                market_data_base_url: var("MARKET_DATA_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_MARKET_DATA_BASE_URL.to_string()),
                market_data_token_header: var("MARKET_DATA_TOKEN_HEADER"),
                market_data_timeout_secs: parse_var(&var, "MARKET_DATA_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_MARKET_DATA_TIMEOUT_SECS),

                fetch_task_timeout_secs: parse_var(&var, "FETCH_TASK_TIMEOUT_SECS")?,
                fetch_concurrency: parse_var(&var, "FETCH_CONCURRENCY")?,
                requests_per_sec: parse_var(&var, "REQUESTS_PER_SEC")?
                    .unwrap_or(DEFAULT_REQUESTS_PER_SEC),
                fetch_lookback_days: parse_var(&var, "FETCH_LOOKBACK_DAYS")?
                    .unwrap_or(DEFAULT_LOOKBACK_DAYS),

                load_chunk_size: parse_var(&var, "LOAD_CHUNK_SIZE")?.unwrap_or(DEFAULT_CHUNK_SIZE),
                load_continue_on_error: parse_var(&var, "LOAD_CONTINUE_ON_ERROR")?.unwrap_or(false),

                sentry_dsn: var("SENTRY_DSN"),
            })
        }

        pub fn require_target_table(&self) -> anyhow::Result<&str> {
            self.target_table
                .as_deref()
                .context("TARGET_TABLE is required")
        }

        pub fn require_ticker_sql(&self) -> anyhow::Result<&str> {
            self.ticker_sql.as_deref().context("TICKER_SQL is required")
        }

        pub fn require_market_data_api_token(&self) -> anyhow::Result<&str> {
            self.market_data_api_token
                .as_deref()
                .context("EODHD_API_TOKEN is required")
        }
    }

    fn parse_var<T, V>(var: &V, key: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
        V: Fn(&str) -> Option<String>,
    {
        var(key)
            .map(|raw| {
                raw.parse::<T>()
                    .with_context(|| format!("{key} has an invalid value: {raw:?}"))
            })
            .transpose()
    }

}
