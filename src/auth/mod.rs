//! App-only authentication for Microsoft Graph
//!
//! The bot acts as itself (no signed-in user), so tokens come from the
//! OAuth2 client credentials grant and are cached until shortly before expiry.

pub mod tokens;

use chrono::Utc;
use oauth2::{
    basic::BasicClient, AuthType, AuthUrl, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl,
};
use tokio::sync::Mutex;

use crate::api::ApiError;
use crate::config::Config;
pub use tokens::StoredToken;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Azure AD app registration used to obtain tokens
pub struct AuthConfig {
    pub tenant: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: &'static str,
}

impl AuthConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tenant: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: GRAPH_SCOPE,
        }
    }
}

/// Build the OAuth2 client from an AuthConfig
fn build_client(auth_config: &AuthConfig) -> anyhow::Result<BasicClient> {
    let auth_url = AuthUrl::new(format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/authorize",
        auth_config.tenant
    ))?;
    let token_url = TokenUrl::new(format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
        auth_config.tenant
    ))?;

    Ok(BasicClient::new(
        ClientId::new(auth_config.client_id.clone()),
        Some(ClientSecret::new(auth_config.client_secret.clone())),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(AuthType::RequestBody))
}

/// Hands out a valid Graph bearer token, refreshing when the cached one expires.
pub struct AppTokenProvider {
    client: BasicClient,
    scope: &'static str,
    cached: Mutex<Option<StoredToken>>,
}

impl AppTokenProvider {
    pub fn new(auth_config: &AuthConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(auth_config)?,
            scope: auth_config.scope,
            cached: Mutex::new(None),
        })
    }

    /// Current access token. Concurrent callers wait on a single refresh.
    pub async fn token(&self) -> Result<String, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref token) = *cached {
            if !token.is_expired(Utc::now()) {
                return Ok(token.token.clone());
            }
        }

        tracing::debug!("Acquiring app token for {}", self.scope);
        let response = self
            .client
            .exchange_client_credentials()
            .add_scope(Scope::new(self.scope.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| ApiError::Token(e.to_string()))?;

        let token = StoredToken::new(
            response.access_token().secret().to_string(),
            response.expires_in().map(|d| d.as_secs()),
            Utc::now(),
        );
        tracing::info!(
            "App token acquired (expires {})",
            token
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}
