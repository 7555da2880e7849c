use crate::config::Settings;
use crate::domain::bar::{DailyBar, DateRange};
use crate::ingest::error::MarketDataError;
use crate::ingest::types::{excerpt, parse_eod_body};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use std::time::Duration;

#[async_trait::async_trait]
pub trait MarketDataClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_daily(
        &self,
        ticker: &str,
        range: DateRange,
    ) -> Result<Vec<DailyBar>, MarketDataError>;
}

/// Where the API token travels on each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `?api_token=...`, the EODHD convention.
    Query,
    Header(HeaderName),
}

#[derive(Debug, Clone)]
pub struct EodhdClient {
    http: reqwest::Client,
    base_url: Url,
    api_token: String,
    placement: TokenPlacement,
}

impl EodhdClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_token = settings.require_market_data_api_token()?.to_string();

        let base_url = Url::parse(&settings.market_data_base_url).with_context(|| {
            format!(
                "MARKET_DATA_BASE_URL is not a valid URL: {}",
                settings.market_data_base_url
            )
        })?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "MARKET_DATA_BASE_URL cannot be used as a base URL"
        );

        let placement = match settings.market_data_token_header.as_deref() {
            Some(name) => TokenPlacement::Header(
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("MARKET_DATA_TOKEN_HEADER is not a valid header: {name}"))?,
            ),
            None => TokenPlacement::Query,
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.market_data_timeout_secs))
            .build()
            .context("failed to build market data http client")?;

        Ok(Self {
            http,
            base_url,
            api_token,
            placement,
        })
    }

    fn url(&self, ticker: &str) -> Result<Url, MarketDataError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MarketDataError::Transport("base url cannot hold a path".to_string()))?
            .pop_if_empty()
            .push("eod")
            .push(ticker);
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, MarketDataError> {
        let mut headers = HeaderMap::new();
        if let TokenPlacement::Header(name) = &self.placement {
            let value = if *name == reqwest::header::AUTHORIZATION {
                format!("Bearer {}", self.api_token)
            } else {
                self.api_token.clone()
            };
            let mut value = HeaderValue::from_str(&value)
                .map_err(|err| MarketDataError::Transport(format!("invalid token header: {err}")))?;
            value.set_sensitive(true);
            headers.insert(name.clone(), value);
        }
        Ok(headers)
    }

    fn query(&self, range: DateRange) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("from", range.from.to_string()),
            ("to", range.to.to_string()),
            ("period", "d".to_string()),
            ("fmt", "json".to_string()),
        ];
        if self.placement == TokenPlacement::Query {
            params.push(("api_token", self.api_token.clone()));
        }
        params
    }
}

#[async_trait::async_trait]
impl MarketDataClient for EodhdClient {
    fn provider_name(&self) -> &'static str {
        "eodhd"
    }

    async fn fetch_daily(
        &self,
        ticker: &str,
        range: DateRange,
    ) -> Result<Vec<DailyBar>, MarketDataError> {
        let res = self
            .http
            .get(self.url(ticker)?)
            .headers(self.headers()?)
            .query(&self.query(range))
            .send()
            .await?;

        let status = res.status();
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = res.text().await?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &text));
        }

        parse_eod_body(ticker, &text)
    }
}

/// Maps a non-success provider status onto the per-ticker error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> MarketDataError {
    match status {
        StatusCode::NOT_FOUND => MarketDataError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => MarketDataError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            MarketDataError::Transport(format!("provider HTTP {status}"))
        }
        _ => MarketDataError::Http {
            status: status.as_u16(),
            body: excerpt(body),
        },
    }
}
