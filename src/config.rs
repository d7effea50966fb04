//! Runtime configuration.
//!
//! Resolved in layers, later ones winning: built-in defaults, an optional
//! TOML file, environment variables (a `.env` file is loaded first), then
//! command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::provider::OpenAiConfig;
use crate::storage::ObjectStoreConfig;
use crate::stream::resume::DEFAULT_GRACE_WINDOW_SECS;

pub const CONFIG_ENV: &str = "CHAT_RELAY_CONFIG";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATABASE_PATH: &str = ".chat-relay/chat.db";
pub const DEFAULT_AUTH_HEADER: &str = "x-user-id";
pub const DEFAULT_MODEL: &str = "echo";
pub const MIN_WEBHOOK_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub port: u16,
    pub database_path: PathBuf,
    pub grace_window_secs: u64,
    pub replay_retention_secs: u64,
    /// Request header carrying the authenticated user id, set by the
    /// identity proxy in front of the service.
    pub auth_header: String,
    pub default_model: String,
    pub system_prompt: Option<String>,
    pub smooth_delay_ms: u64,
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
    pub openai: Option<OpenAiConfig>,
    pub object_store: Option<ObjectStoreConfig>,
    /// Shared secret the identity provider sends with user webhooks. The
    /// webhook route is only mounted when this is set.
    pub webhook_secret: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            grace_window_secs: DEFAULT_GRACE_WINDOW_SECS as u64,
            replay_retention_secs: 5,
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            smooth_delay_ms: 20,
            log_filter: "chat_relay=info,tower_http=info".to_string(),
            log_dir: None,
            openai: None,
            object_store: None,
            webhook_secret: None,
        }
    }
}

/// Partial configuration as read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    port: Option<u16>,
    database_path: Option<PathBuf>,
    grace_window_secs: Option<u64>,
    replay_retention_secs: Option<u64>,
    auth_header: Option<String>,
    default_model: Option<String>,
    system_prompt: Option<String>,
    smooth_delay_ms: Option<u64>,
    log_filter: Option<String>,
    log_dir: Option<PathBuf>,
    openai: Option<OpenAiConfig>,
    object_store: Option<ObjectStoreConfig>,
    webhook_secret: Option<String>,
}

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        let file = overrides
            .config_file
            .clone()
            .or_else(|| env_var(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = file {
            config.merge_file(&path)?;
        }

        config.merge_env()?;

        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(path) = &overrides.database_path {
            config.database_path = path.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut self.port, file.port);
        set(&mut self.database_path, file.database_path);
        set(&mut self.grace_window_secs, file.grace_window_secs);
        set(&mut self.replay_retention_secs, file.replay_retention_secs);
        set(&mut self.auth_header, file.auth_header);
        set(&mut self.default_model, file.default_model);
        set(&mut self.smooth_delay_ms, file.smooth_delay_ms);
        set(&mut self.log_filter, file.log_filter);
        if file.system_prompt.is_some() {
            self.system_prompt = file.system_prompt;
        }
        if file.log_dir.is_some() {
            self.log_dir = file.log_dir;
        }
        if file.openai.is_some() {
            self.openai = file.openai;
        }
        if file.object_store.is_some() {
            self.object_store = file.object_store;
        }
        if file.webhook_secret.is_some() {
            self.webhook_secret = file.webhook_secret;
        }
        Ok(())
    }

    fn merge_env(&mut self) -> Result<()> {
        if let Some(port) = env_var("PORT") {
            self.port = port.parse().context("PORT must be a port number")?;
        }
        if let Some(path) = env_var("DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(secs) = env_var("RESUME_GRACE_WINDOW_SECS") {
            self.grace_window_secs = secs
                .parse()
                .context("RESUME_GRACE_WINDOW_SECS must be a number of seconds")?;
        }
        if let Some(secs) = env_var("STREAM_REPLAY_RETENTION_SECS") {
            self.replay_retention_secs = secs
                .parse()
                .context("STREAM_REPLAY_RETENTION_SECS must be a number of seconds")?;
        }
        if let Some(header) = env_var("AUTH_USER_HEADER") {
            self.auth_header = header;
        }
        if let Some(model) = env_var("DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Some(filter) = env_var("RUST_LOG") {
            self.log_filter = filter;
        }
        if let Some(secret) = env_var("AUTH_WEBHOOK_SECRET") {
            self.webhook_secret = Some(secret);
        }

        if let Some(api_key) = env_var("OPENAI_API_KEY") {
            let models = env_var("OPENAI_MODELS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["gpt-4o-mini".to_string()]);
            self.openai = Some(OpenAiConfig {
                base_url: env_var("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                models,
            });
        }

        if let Some(store) = ObjectStoreConfig::from_env()? {
            self.object_store = Some(store);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.grace_window_secs == 0 {
            anyhow::bail!("resume grace window must be positive");
        }
        if self.auth_header.trim().is_empty() {
            anyhow::bail!("auth header name must not be empty");
        }
        if self
            .webhook_secret
            .as_deref()
            .is_some_and(|secret| secret.trim().len() < MIN_WEBHOOK_SECRET_LEN)
        {
            anyhow::bail!("webhook secret must be at least {MIN_WEBHOOK_SECRET_LEN} characters");
        }
        if let Some(openai) = &self.openai {
            if openai.models.is_empty() {
                anyhow::bail!("at least one OpenAI model must be configured");
            }
        }
        Ok(())
    }

    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs as i64)
    }

    pub fn replay_retention(&self) -> Duration {
        Duration::from_secs(self.replay_retention_secs)
    }

    pub fn smooth_delay(&self) -> Duration {
        Duration::from_millis(self.smooth_delay_ms)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
