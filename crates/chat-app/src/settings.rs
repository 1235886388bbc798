use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use quill_conversation::{CoordinatorConfig, DEFAULT_SYSTEM_PROMPT};
use quill_llm::{DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL, ProviderConfig, RIG_OPENAI_PROVIDER_ID};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "quill";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "quill.db";
pub const ENV_PREFIX: &str = "QUILL_";
pub const CONFIG_PATH_ENV: &str = "QUILL_CONFIG";
pub const API_KEY_FALLBACK_ENV: &str = "DEEPSEEK_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

impl ProviderSettings {
    /// `None` until an api key is configured.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.base_url,
            Some(self.model.clone()),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Prior messages sent with each prompt; 0 sends the prompt alone.
    #[serde(default)]
    pub context_messages: usize,
    #[serde(default)]
    pub show_thoughts: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            request_timeout_secs: default_request_timeout_secs(),
            context_messages: 0,
            show_thoughts: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub chat: ChatSettings,
}

impl Settings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            model_id: self.provider.model.clone(),
            system_prompt: self.chat.system_prompt.clone(),
            request_timeout: Duration::from_secs(self.chat.request_timeout_secs),
            context_messages: self.chat.context_messages,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.provider.provider_id = non_blank_or(self.provider.provider_id, default_provider_id);
        self.provider.api_key = self.provider.api_key.trim().to_string();
        self.provider.base_url = non_blank_or(self.provider.base_url, default_base_url);
        self.provider.model = non_blank_or(self.provider.model, default_model);
        self.storage.database_path =
            non_blank_or(self.storage.database_path, default_database_path);
        if self.chat.request_timeout_secs == 0 {
            self.chat.request_timeout_secs = default_request_timeout_secs();
        }
        self
    }
}

pub struct SettingsStore {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".quill"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the settings file, then `QUILL_` environment variables.
    /// `QUILL_CONFIG` overrides the settings file location.
    pub fn load() -> Self {
        let config_path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        Self::load_from(config_path, true)
    }

    fn load_from(config_path: PathBuf, with_env: bool) -> Self {
        let mut figment = Self::layered(&config_path);
        if with_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        let settings = Self::extract(figment, &config_path);
        Self::with_settings(settings, config_path)
    }

    fn with_settings(mut settings: Settings, config_path: PathBuf) -> Self {
        if settings.provider.api_key.is_empty()
            && let Some(api_key) = fallback_api_key()
        {
            tracing::debug!(env = API_KEY_FALLBACK_ENV, "using api key from environment");
            settings.provider.api_key = api_key;
        }

        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    pub fn set_model(&self, model: &str) -> Result<Arc<Settings>, SettingsError> {
        let mut settings = Settings::clone(&self.settings());
        settings.provider.model = model.trim().to_string();
        self.update(settings)?;
        Ok(self.settings())
    }

    fn layered(config_path: &Path) -> Figment {
        let figment = Figment::from(Serialized::defaults(Settings::default()));
        if config_path.exists() {
            figment.merge(Json::file(config_path))
        } else {
            tracing::info!(path = ?config_path, "settings file not found, using defaults");
            figment
        }
    }

    fn extract(figment: Figment, config_path: &Path) -> Settings {
        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?config_path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        // The fallback key from the environment stays out of the file.
        let mut on_disk = settings.clone();
        if fallback_api_key().is_some_and(|api_key| api_key == on_disk.provider.api_key) {
            on_disk.provider.api_key.clear();
        }

        let content = serde_json::to_string_pretty(&on_disk).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn fallback_api_key() -> Option<String> {
    std::env::var(API_KEY_FALLBACK_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_blank_or(value: String, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    RIG_OPENAI_PROVIDER_ID.to_string()
}

fn default_base_url() -> String {
    DEFAULT_OPENAI_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".quill"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}
