use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_PROVIDER_ID, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{DEFAULT_COMPLETION_TIMEOUT, DEFAULT_SYSTEM_PROMPT, SendOptions};

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "parley.db";
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_timeout_secs(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl CompletionSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            model_id: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        if self.system_prompt.trim().is_empty() {
            self.system_prompt = default_system_prompt();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Falls back to the platform data directory when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub message_retention_hours: Option<u64>,
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".parley"))
                .join(DATABASE_FILE_NAME)
        })
    }

    pub fn message_retention(&self) -> Option<Duration> {
        self.message_retention_hours
            .map(|hours| Duration::from_secs(hours.saturating_mul(60 * 60)))
    }

    fn normalized(mut self) -> Self {
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self.message_retention_hours = self.message_retention_hours.filter(|hours| *hours > 0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub completion: CompletionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl AppSettings {
    pub fn normalized(self) -> Self {
        Self {
            completion: self.completion.normalized(),
            storage: self.storage.normalized(),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    /// `PARLEY_CONFIG` wins over the platform config directory.
    pub fn default_config_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_config_dir().join(SETTINGS_FILE_NAME))
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Writes a defaults file when none exists yet. Returns whether it wrote.
    ///
    /// Environment overrides are not written, so keys passed that way stay off disk.
    pub fn persist_if_missing(&self) -> Result<bool, SettingsError> {
        if self.config_path.exists() {
            return Ok(false);
        }
        self.persist(&AppSettings::default())?;
        Ok(true)
    }

    fn load_from(path: &Path) -> AppSettings {
        let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
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

        tracing::info!(path = %self.config_path.display(), "saved settings");
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

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_COMPLETION_TIMEOUT.as_secs()
}
