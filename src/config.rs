use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheConfig;

pub const DATA_DIR_ENV: &str = "AIMAIL_DATA_DIR";

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";
const DEFAULT_OLLAMA_EMBED_MODEL: &str = "nomic-embed-text";
const DEFAULT_OLLAMA_VISION_MODEL: &str = "llava";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OPENAI_EMBED_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine home directory")]
    HomeDir,

    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
}

/// Runtime configuration resolved from `AIMAIL_*` environment variables.
///
/// User-facing preferences (auto-send, prompt fields, filters) live in
/// `settings.json` instead; see [`crate::store::settings::Settings`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_embed_model: String,
    pub ollama_vision_model: String,
    pub openai_url: String,
    pub openai_model: String,
    pub openai_embed_model: String,
    pub local_timeout: Duration,
    pub remote_timeout: Duration,
    pub generation_timeout: Duration,
    pub web_fetch_timeout: Duration,
    pub license_url: Option<String>,
    pub license_key: Option<String>,
    pub cache: CacheConfig,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            ollama_embed_model: DEFAULT_OLLAMA_EMBED_MODEL.to_string(),
            ollama_vision_model: DEFAULT_OLLAMA_VISION_MODEL.to_string(),
            openai_url: DEFAULT_OPENAI_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            openai_embed_model: DEFAULT_OPENAI_EMBED_MODEL.to_string(),
            local_timeout: Duration::from_secs(6),
            remote_timeout: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(120),
            web_fetch_timeout: Duration::from_secs(15),
            license_url: None,
            license_key: None,
            cache: CacheConfig::default(),
        }
    }

    pub fn from_env(data_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = match data_dir.or_else(|| env_value(DATA_DIR_ENV).map(PathBuf::from)) {
            Some(dir) => dir,
            None => Self::default_data_dir()?,
        };

        let mut config = Self::new(data_dir);
        if let Some(url) = env_value("AIMAIL_OLLAMA_URL") {
            config.ollama_url = url;
        }
        if let Some(model) = env_value("AIMAIL_OLLAMA_MODEL") {
            config.ollama_model = model;
        }
        if let Some(model) = env_value("AIMAIL_OLLAMA_EMBED_MODEL") {
            config.ollama_embed_model = model;
        }
        if let Some(model) = env_value("AIMAIL_OLLAMA_VISION_MODEL") {
            config.ollama_vision_model = model;
        }
        if let Some(url) = env_value("AIMAIL_OPENAI_URL") {
            config.openai_url = url;
        }
        if let Some(model) = env_value("AIMAIL_OPENAI_MODEL") {
            config.openai_model = model;
        }
        if let Some(model) = env_value("AIMAIL_OPENAI_EMBED_MODEL") {
            config.openai_embed_model = model;
        }
        config.license_url = env_value("AIMAIL_LICENSE_URL");
        config.license_key = env_value("AIMAIL_LICENSE_KEY");

        if let Some(secs) = env_secs("AIMAIL_LOCAL_TIMEOUT_SECS")? {
            config.local_timeout = secs;
        }
        if let Some(secs) = env_secs("AIMAIL_REMOTE_TIMEOUT_SECS")? {
            config.remote_timeout = secs;
        }
        if let Some(secs) = env_secs("AIMAIL_GENERATION_TIMEOUT_SECS")? {
            config.generation_timeout = secs;
        }
        if let Some(secs) = env_secs("AIMAIL_FETCH_INTERVAL_SECS")? {
            config.cache.min_fetch_interval = secs;
        }
        if let Some(secs) = env_secs("AIMAIL_METADATA_INTERVAL_SECS")? {
            config.cache.metadata_interval = secs;
        }
        if let Some(secs) = env_secs("AIMAIL_CACHE_MAX_AGE_SECS")? {
            config.cache.max_age = secs;
        }

        Ok(config)
    }

    pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDir)?;
        Ok(home.join(".aimail"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Files in this directory are attached to every outgoing reply.
    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    /// Optional workbook whose sheets are fed into every prompt.
    pub fn knowledge_workbook(&self) -> PathBuf {
        self.data_dir.join("knowledge.xlsx")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_secs(name: &str) -> Result<Option<Duration>, ConfigError> {
    env_value(name)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: raw,
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::AppConfig;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = AppConfig::new("/tmp/aimail-config-test");
        assert_eq!(config.local_timeout, Duration::from_secs(6));
        assert_eq!(config.generation_timeout, Duration::from_secs(120));
        assert_eq!(config.cache.min_fetch_interval, Duration::from_secs(30));
        assert_eq!(config.cache.max_age, Duration::from_secs(300));
        assert!(config.attachments_dir().ends_with("attachments"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config =
            AppConfig::from_env(Some("/tmp/aimail-explicit".into())).expect("resolve config");
        assert_eq!(config.data_dir().to_str(), Some("/tmp/aimail-explicit"));
    }
}
