pub mod bars;
pub mod credentials;
pub mod lock;
pub mod tickers;

use crate::config::Settings;
use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

const DEFAULT_PG_PORT: u16 = 5432;

/// Opens the run's pool. `DATABASE_URL` wins; otherwise `DB_SERVER`/`DB_NAME`/
/// `DB_USER` with the password taken from the configured token provider.
pub async fn connect(settings: &Settings) -> anyhow::Result<sqlx::PgPool> {
    anyhow::ensure!(
        settings.db_max_connections >= 2,
        "DB_MAX_CONNECTIONS must be >= 2 (one connection holds the run lock)"
    );
    let pool_opts = PgPoolOptions::new().max_connections(settings.db_max_connections);

    if let Some(url) = settings.database_url.as_deref() {
        return pool_opts
            .connect(url)
            .await
            .context("connect DATABASE_URL failed");
    }

    let server = settings
        .db_server
        .as_deref()
        .context("DATABASE_URL or DB_SERVER is required")?;
    let db_name = settings.db_name.as_deref().context("DB_NAME is required")?;
    let user = settings.db_user.as_deref().context("DB_USER is required")?;
    let (host, port) = split_server(server)?;

    let provider = credentials::provider_from_settings(settings)?;
    let token = provider
        .access_token()
        .await
        .with_context(|| format!("failed to obtain database token ({})", provider.source_name()))?;

    tracing::info!(%host, port, db = db_name, token_source = provider.source_name(), "connecting to database");

    let opts = PgConnectOptions::new()
        .host(host)
        .port(port)
        .database(db_name)
        .username(user)
        .password(&token)
        .ssl_mode(PgSslMode::Require);

    pool_opts
        .connect_with(opts)
        .await
        .with_context(|| format!("connect {host}:{port}/{db_name} failed"))
}

/// Creates the default `daily_bars` table when asked to.
pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Splits `host[:port]`; the port defaults to 5432.
pub fn split_server(server: &str) -> anyhow::Result<(&str, u16)> {
    let server = server.trim();
    anyhow::ensure!(!server.is_empty(), "DB_SERVER must be non-empty");
    match server.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("DB_SERVER has an invalid port: {server}"))?;
            anyhow::ensure!(!host.is_empty(), "DB_SERVER has an empty host: {server}");
            Ok((host, port))
        }
        None => Ok((server, DEFAULT_PG_PORT)),
    }
}
