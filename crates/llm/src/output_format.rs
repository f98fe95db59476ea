use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{ParseKindError, ParseKindSnafu};

/// Constrained shape requested from the model.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Default,
    Json,
    Template,
    Regex,
    Html,
    Csv,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 6] = [
        OutputFormat::Default,
        OutputFormat::Json,
        OutputFormat::Template,
        OutputFormat::Regex,
        OutputFormat::Html,
        OutputFormat::Csv,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Json => "json",
            Self::Template => "template",
            Self::Regex => "regex",
            Self::Html => "html",
            Self::Csv => "csv",
        }
    }

    /// Whether requests in this format carry a format spec on the wire.
    pub const fn carries_spec(&self) -> bool {
        !matches!(self, Self::Default)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ParseKindError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == normalized)
            .ok_or_else(|| {
                ParseKindSnafu {
                    kind: "output format",
                    raw: raw.to_string(),
                }
                .build()
            })
    }
}
