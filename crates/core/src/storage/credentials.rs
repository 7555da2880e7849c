use crate::config::Settings;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const TOKEN_TIMEOUT_SECS: u64 = 10;

/// Yields the bearer token presented to the database as its password.
///
/// Called once per connection attempt; tokens are never cached past a run.
#[async_trait::async_trait]
pub trait AccessTokenProvider: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn access_token(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    fn source_name(&self) -> &'static str {
        "env"
    }

    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Managed-identity token from the platform metadata service.
///
/// Uses the App Service style endpoint when `IDENTITY_ENDPOINT` and
/// `IDENTITY_HEADER` are present, the VM instance metadata endpoint otherwise.
#[derive(Debug, Clone)]
pub struct ManagedIdentityTokenProvider {
    http: reqwest::Client,
    endpoint: String,
    identity_header: Option<String>,
    resource: String,
    client_id: Option<String>,
}

impl ManagedIdentityTokenProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let endpoint = std::env::var("IDENTITY_ENDPOINT").ok();
        let identity_header = std::env::var("IDENTITY_HEADER").ok();
        let (endpoint, identity_header) = match (endpoint, identity_header) {
            (Some(endpoint), Some(header)) => (endpoint, Some(header)),
            _ => (IMDS_ENDPOINT.to_string(), None),
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(TOKEN_TIMEOUT_SECS))
            .build()
            .context("failed to build identity http client")?;

        Ok(Self {
            http,
            endpoint,
            identity_header,
            resource: settings.db_token_resource.clone(),
            client_id: settings.azure_client_id.clone(),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        match &self.identity_header {
            Some(secret) => {
                headers.insert("X-IDENTITY-HEADER", HeaderValue::from_str(secret)?);
            }
            None => {
                headers.insert("Metadata", HeaderValue::from_static("true"));
            }
        }
        Ok(headers)
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let api_version = if self.identity_header.is_some() {
            APP_SERVICE_API_VERSION
        } else {
            IMDS_API_VERSION
        };
        let mut params = vec![
            ("api-version", api_version.to_string()),
            ("resource", self.resource.clone()),
        ];
        if let Some(client_id) = &self.client_id {
            params.push(("client_id", client_id.clone()));
        }
        params
    }
}

#[async_trait::async_trait]
impl AccessTokenProvider for ManagedIdentityTokenProvider {
    fn source_name(&self) -> &'static str {
        "managed-identity"
    }

    async fn access_token(&self) -> Result<String> {
        let res = self
            .http
            .get(&self.endpoint)
            .headers(self.headers()?)
            .query(&self.query())
            .send()
            .await
            .context("managed identity token request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read managed identity token response")?;
        if !status.is_success() {
            anyhow::bail!("managed identity token HTTP {status}: {text}");
        }

        parse_token_response(&text)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn parse_token_response(text: &str) -> Result<String> {
    let parsed = serde_json::from_str::<TokenResponse>(text)
        .context("failed to parse managed identity token response")?;
    anyhow::ensure!(
        !parsed.access_token.trim().is_empty(),
        "managed identity returned an empty access token"
    );
    Ok(parsed.access_token)
}

pub fn provider_from_settings(settings: &Settings) -> Result<Box<dyn AccessTokenProvider>> {
    match settings.db_token_source.as_deref().unwrap_or("env") {
        "env" => {
            let token = settings
                .db_access_token
                .as_deref()
                .context("DB_ACCESS_TOKEN is required when DB_TOKEN_SOURCE=env")?;
            Ok(Box::new(StaticTokenProvider::new(token)))
        }
        "managed-identity" => Ok(Box::new(ManagedIdentityTokenProvider::from_settings(
            settings,
        )?)),
        other => anyhow::bail!("unknown DB_TOKEN_SOURCE: {other} (expected env or managed-identity)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn parses_managed_identity_token_body() {
        let body = r#"{
            "access_token": "eyJ0eXAi",
            "expires_in": "86399",
            "resource": "https://ossrdbms-aad.database.windows.net",
            "token_type": "Bearer"
        }"#;
        assert_eq!(parse_token_response(body).unwrap(), "eyJ0eXAi");
        assert!(parse_token_response(r#"{"access_token": ""}"#).is_err());
        assert!(parse_token_response("not json").is_err());
    }

    #[tokio::test]
    async fn env_source_requires_a_token() {
        assert!(provider_from_settings(&settings(&[])).is_err());

        let provider = provider_from_settings(&settings(&[("DB_ACCESS_TOKEN", "tok")])).unwrap();
        assert_eq!(provider.source_name(), "env");
        assert_eq!(provider.access_token().await.unwrap(), "tok");
    }

    #[test]
    fn rejects_unknown_token_source() {
        let err = provider_from_settings(&settings(&[("DB_TOKEN_SOURCE", "kerberos")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("kerberos"));
    }

    #[test]
    fn instance_metadata_query_carries_resource_and_client_id() {
        let provider = ManagedIdentityTokenProvider {
            http: reqwest::Client::new(),
            endpoint: IMDS_ENDPOINT.to_string(),
            identity_header: None,
            resource: "https://ossrdbms-aad.database.windows.net".to_string(),
            client_id: Some("abc".to_string()),
        };
        let q = provider.query();
        assert!(q.contains(&("api-version", "2018-02-01".to_string())));
        assert!(q.contains(&("client_id", "abc".to_string())));
        assert_eq!(provider.headers().unwrap().get("Metadata").unwrap(), "true");
    }
}
