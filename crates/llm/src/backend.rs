use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{ParseKindError, ParseKindSnafu};

pub const DEFAULT_VLLM_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Inference backend the generation service can route a request to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Backend {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "vllm")]
    Vllm,
    #[default]
    #[serde(rename = "ollama")]
    Ollama,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::OpenAi, Backend::Vllm, Backend::Ollama];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Vllm => "vllm",
            Self::Ollama => "ollama",
        }
    }

    /// Hard default endpoint; OpenAI uses the vendor endpoint resolved server-side.
    pub const fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => None,
            Self::Vllm => Some(DEFAULT_VLLM_BASE_URL),
            Self::Ollama => Some(DEFAULT_OLLAMA_BASE_URL),
        }
    }

    pub fn default_connection(&self) -> ConnectionParams {
        ConnectionParams {
            base_url: self.default_base_url().map(str::to_string),
            api_key: None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ParseKindError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|backend| backend.as_str() == normalized)
            .ok_or_else(|| {
                ParseKindSnafu {
                    kind: "backend",
                    raw: raw.to_string(),
                }
                .build()
            })
    }
}

/// Connection parameters in effect for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ConnectionParams {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            api_key: api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }
}
