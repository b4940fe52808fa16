use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use confab_llm::{
    DEFAULT_OPENAI_MODEL, LlmProvider, MOCK_PROVIDER_ID, MockProvider, ProviderConfig,
    ProviderResult, create_provider,
};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "confab";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "CONFAB_";
/// Lowest-priority credential source, below the file and `CONFAB_API_KEY`.
pub const FALLBACK_API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub preamble: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            preamble: None,
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self
    }

    fn uses_mock(&self) -> bool {
        self.provider_id == MOCK_PROVIDER_ID
    }

    /// Provider config, or `None` when a remote provider has no API key.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if !self.uses_mock() && self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
        ))
    }

    /// Builds the configured provider, falling back to the offline mock when
    /// no API key is available.
    pub fn build_provider(&self) -> ProviderResult<Arc<dyn LlmProvider>> {
        match self.to_provider_config() {
            Some(config) => create_provider(config),
            None => {
                tracing::warn!(
                    provider_id = %self.provider_id,
                    "no API key configured, replies come from the offline mock provider"
                );
                Ok(Arc::new(MockProvider::echo()))
            }
        }
    }

    /// Model to open sessions with on `provider`.
    pub fn model_for(&self, provider: &dyn LlmProvider) -> String {
        if provider.id() == MOCK_PROVIDER_ID {
            provider.default_model().to_string()
        } else {
            self.model.clone()
        }
    }
}

/// Reads settings from defaults, [`FALLBACK_API_KEY_VAR`], the JSON file at
/// `path` and finally `CONFAB_*` variables, later layers winning.
pub fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    extract_layers(Some(path), "extract-layered-settings", path)
}

/// Same layers as [`load_settings`] with the file left out.
pub fn load_env_settings(path: &Path) -> Result<Settings, SettingsError> {
    extract_layers(None, "extract-env-settings", path)
}

fn extract_layers(
    file: Option<&Path>,
    stage: &'static str,
    path: &Path,
) -> Result<Settings, SettingsError> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(
        Env::raw()
            .only(&[FALLBACK_API_KEY_VAR])
            .map(|_| "api_key".into()),
    );
    if let Some(file) = file {
        figment = figment.merge(Json::file(file));
    }

    let settings = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract::<Settings>()
        .context(ExtractSnafu {
            stage,
            path: path.to_path_buf(),
        })?;
    Ok(settings.normalized())
}

fn file_layer(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(Settings::default())).merge(Json::file(path))
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".confab"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_or_default(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Saves `model` to the settings file. Only the file layer is written, so
    /// credentials from the environment never reach disk.
    pub fn set_model(&self, model: &str) -> Result<(), SettingsError> {
        let mut on_disk = file_layer(&self.config_path)
            .extract::<Settings>()
            .context(ExtractSnafu {
                stage: "extract-file-settings",
                path: self.config_path.clone(),
            })?;
        on_disk.model = model.to_string();
        let on_disk = on_disk.normalized();
        self.persist(&on_disk)?;

        let mut current = (*self.settings.load_full()).clone();
        current.model = on_disk.model;
        self.settings.store(Arc::new(current));
        Ok(())
    }

    fn load_or_default(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let error = match load_settings(path) {
            Ok(settings) => return settings,
            Err(error) => error,
        };
        tracing::warn!("{error}. ignoring the settings file");

        load_env_settings(path).unwrap_or_else(|error| {
            tracing::warn!("{error}. using defaults");
            Settings::default()
        })
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
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

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: figment::Error,
    },
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

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}
