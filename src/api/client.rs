//! Authenticated HTTP client for Microsoft Graph
//!
//! Wraps reqwest::Client with app token injection, a per-request timeout
//! and status code mapping to `ApiError`.

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use super::ApiError;
use crate::auth::{AppTokenProvider, AuthConfig};
use crate::config::Config;

/// Graph client shared by the call core, the subscription manager and the poller.
pub struct GraphClient {
    http: reqwest::Client,
    tokens: AppTokenProvider,
    base_url: String,
    callback_url: String,
    timeout: std::time::Duration,
}

impl GraphClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        let tokens = AppTokenProvider::new(&AuthConfig::from_config(config))
            .context("Invalid OAuth2 configuration")?;

        Ok(Self {
            http,
            tokens,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            callback_url: config.answer_callback_url().to_string(),
            timeout: config.request_timeout(),
        })
    }

    /// Callback URI registered when answering calls.
    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    /// Absolute URL for a Graph path. `@odata.nextLink` values pass through as-is.
    fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let token = self.tokens.token().await?;
        let url = self.url(path);
        tracing::debug!("Graph {} {}", method, url);

        let mut request = self.http.request(method, &url).bearer_auth(&token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout {
                    operation: format!("request to {}", url),
                    after: self.timeout,
                }
            } else {
                ApiError::Transport {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        check_response(resp, &url).await
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response, ApiError> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ApiError> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ApiError> {
        self.send(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<reqwest::Response, ApiError> {
        self.send(Method::DELETE, path, None).await
    }
}

/// Decode a JSON response body.
pub(crate) async fn json_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let url = resp.url().to_string();
    resp.json().await.map_err(|e| ApiError::Decode {
        url,
        message: e.to_string(),
    })
}

/// Check HTTP response status code and map failures to `ApiError`.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let url = url.to_string();
    match status {
        StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized { url }),
        StatusCode::NOT_FOUND => Err(ApiError::NotFound { url }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            Err(ApiError::RateLimited { url, retry_after })
        }
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            })
        }
    }
}
