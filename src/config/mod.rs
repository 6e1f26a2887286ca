//! Service configuration

use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{ChangeType, SubscriptionSpec};

const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AAD tenant the bot is registered in
    pub tenant_id: String,
    /// App registration (bot) client ID
    pub client_id: String,
    /// App registration client secret
    pub client_secret: String,
    /// Graph API base URL
    pub graph_base_url: String,
    /// Address the webhook/status server binds to
    pub listen_addr: SocketAddr,
    /// Callback URI handed to the platform when answering calls
    pub callback_url: String,
    /// Public URL the platform posts change notifications to
    pub notification_url: String,
    /// Secret echoed back in every change notification. Generated and saved
    /// on first use so it outlives restarts.
    pub client_state: String,
    pub subscription_ttl_minutes: i64,
    /// Renew once fewer than this many minutes remain
    pub renewal_window_minutes: i64,
    pub renewal_interval_secs: u64,
    pub polling_interval_secs: u64,
    /// How far before the last cursor each poll reaches back
    pub polling_lookback_secs: i64,
    /// How long polled record ids are remembered for deduplication
    pub seen_ttl_secs: i64,
    /// Start polling on boot even if subscriptions were created
    pub polling_on_start: bool,
    /// Quiet period after termination before a session is evicted
    pub session_quiet_period_secs: i64,
    pub eviction_interval_secs: u64,
    /// Upper bound for any single platform call
    pub request_timeout_secs: u64,
    /// Larger webhook bodies are rejected with 400
    pub max_body_bytes: usize,
    /// Concurrent local recordings allowed
    pub max_concurrent_recordings: usize,
    /// Resources subscribed on startup (kept last: TOML tables follow plain values)
    pub subscription_resources: Vec<SubscriptionSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            graph_base_url: DEFAULT_GRAPH_BASE.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3978)),
            callback_url: String::new(),
            notification_url: String::new(),
            client_state: String::new(),
            subscription_ttl_minutes: 4230,
            renewal_window_minutes: 60,
            renewal_interval_secs: 300,
            polling_interval_secs: 60,
            polling_lookback_secs: 900,
            seen_ttl_secs: 3600,
            polling_on_start: false,
            session_quiet_period_secs: 300,
            eviction_interval_secs: 60,
            request_timeout_secs: 15,
            max_body_bytes: 256 * 1024,
            max_concurrent_recordings: 500,
            subscription_resources: vec![
                SubscriptionSpec::new("communications/callRecords", &[ChangeType::Created]),
                SubscriptionSpec::new(
                    "communications/onlineMeetings/?$filter=JoinWebUrl eq 'all'",
                    &[ChangeType::Created, ChangeType::Updated],
                ),
            ],
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "teams-recorder", "teams-recorder")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`, or the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to `path`, or the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Restrictive permissions (contains the client secret)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Generate and persist a `client_state` if none is configured yet.
    /// Returns true when a new one was written.
    pub fn ensure_client_state(&mut self, path: Option<&Path>) -> Result<bool> {
        if !self.client_state.is_empty() {
            return Ok(false);
        }
        self.client_state = crate::subscriptions::generate_client_state();
        self.save(path)?;
        tracing::info!("Generated a new subscription clientState");
        Ok(true)
    }

    /// Check the settings needed to talk to the platform.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.tenant_id.is_empty(), "tenant_id is not set");
        ensure!(!self.client_id.is_empty(), "client_id is not set");
        ensure!(!self.client_secret.is_empty(), "client_secret is not set");
        ensure!(
            self.notification_url.starts_with("https://"),
            "notification_url must be an https URL"
        );
        ensure!(
            self.renewal_window_minutes < self.subscription_ttl_minutes,
            "renewal_window_minutes must be shorter than subscription_ttl_minutes"
        );
        if self.seen_ttl_secs < self.polling_lookback_secs + self.polling_interval_secs as i64 {
            tracing::warn!(
                "seen_ttl_secs ({}) is shorter than lookback + interval; polled records may be reported twice",
                self.seen_ttl_secs
            );
        }
        Ok(())
    }

    /// Callback URI for answered calls, falling back to the notification URL.
    pub fn answer_callback_url(&self) -> &str {
        if self.callback_url.is_empty() {
            &self.notification_url
        } else {
            &self.callback_url
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn subscription_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.subscription_ttl_minutes)
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.renewal_window_minutes)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn polling_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.polling_lookback_secs)
    }

    pub fn seen_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seen_ttl_secs)
    }

    pub fn session_quiet_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_quiet_period_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}
