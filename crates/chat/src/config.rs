use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use quill_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use quill_storage::DEFAULT_STORE_RELATIVE_PATH;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const CONFIG_DIRECTORY_NAME: &str = "quill";
pub const CONFIG_FILE_NAME: &str = "config.json";

/// How many of the most recent session messages accompany a new request.
pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub preamble: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            preamble: String::new(),
            temperature: None,
            max_tokens: None,
            max_context_messages: default_max_context_messages(),
            store_path: None,
        }
    }
}

impl ChatConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".quill"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn default_store_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_STORE_RELATIVE_PATH)
    }

    /// Loads configuration from `path`, falling back to defaults for missing
    /// keys and for unreadable files.
    pub fn load_from(path: &PathBuf) -> Self {
        if !path.exists() {
            tracing::info!("config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        let figment =
            Figment::from(Serialized::defaults(ChatConfig::default())).merge(Json::file(path));

        match figment.extract::<ChatConfig>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse config from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        if self.max_context_messages == 0 {
            self.max_context_messages = default_max_context_messages();
        }

        self
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.model.clone()),
        ))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(Self::default_store_path)
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_max_context_messages() -> usize {
    DEFAULT_MAX_CONTEXT_MESSAGES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::load_from(&dir.path().join("absent.json"));
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn load_from_merges_partial_config_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_key": " secret ", "model": "gpt-4o"}"#).unwrap();

        let config = ChatConfig::load_from(&path);
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.max_context_messages, DEFAULT_MAX_CONTEXT_MESSAGES);
    }

    #[test]
    fn load_from_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{broken").unwrap();

        let config = ChatConfig::load_from(&path);
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn provider_config_requires_an_api_key() {
        let config = ChatConfig::default();
        assert!(config.to_provider_config().is_none());

        let config = ChatConfig {
            api_key: "key".to_string(),
            ..ChatConfig::default()
        };
        let provider_config = config.to_provider_config().unwrap();
        assert_eq!(provider_config.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(provider_config.default_model.as_deref(), Some(DEFAULT_OPENAI_MODEL));
    }
}
