use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use structura_core::preferences::DEFAULT_HISTORY_LIMIT;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const SETTINGS_DIRECTORY_NAME: &str = "structura";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const PREFERENCES_FILE_NAME: &str = "preferences.db";
pub const ENV_PREFIX: &str = "STRUCTURA_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "AppConfig::default_preferences_path")]
    pub preferences_path: PathBuf,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            preferences_path: Self::default_preferences_path(),
            history_limit: default_history_limit(),
        }
    }
}

impl AppConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".structura"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn default_preferences_path() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".structura"))
            .join(PREFERENCES_FILE_NAME)
    }

    /// Defaults, then the settings file, then `STRUCTURA_*` environment variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        Self::figment(path)
            .extract::<Self>()
            .map(Self::normalized)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.api_url = match self.api_url.trim().trim_end_matches('/') {
            "" => default_api_url(),
            api_url => api_url.to_string(),
        };
        self.token = self
            .token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        if self.history_limit == 0 {
            self.history_limit = default_history_limit();
        }

        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("invalid settings at {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: figment::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
