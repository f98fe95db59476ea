use snafu::Snafu;
use structura_llm::{ApiError, Backend, OutputFormat};
use structura_storage::{MessageId, PresetId, StorageError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FormatError {
    #[snafu(display("json schema does not parse on `{stage}`: {source}"))]
    InvalidJson {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("pattern uses unsupported {construct} `{token}`"))]
    Lookaround {
        stage: &'static str,
        construct: &'static str,
        token: &'static str,
    },
    #[snafu(display("pattern does not compile on `{stage}`: {source}"))]
    InvalidRegex {
        stage: &'static str,
        source: regex::Error,
    },
}

pub type FormatResult<T> = Result<T, FormatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("backend {backend} is not connected"))]
    Disconnected {
        stage: &'static str,
        backend: Backend,
    },
    #[snafu(display("no model selected for backend {backend}"))]
    NoModel {
        stage: &'static str,
        backend: Backend,
    },
    #[snafu(display("a generation is already running"))]
    Busy { stage: &'static str },
    #[snafu(display("backend {backend} does not support output format {format}"))]
    UnsupportedFormat {
        stage: &'static str,
        backend: Backend,
        format: OutputFormat,
    },
    #[snafu(display("invalid {format} spec: {source}"))]
    InvalidFormatSpec {
        stage: &'static str,
        format: OutputFormat,
        source: FormatError,
    },
    #[snafu(display("output format {format} keeps no presets"))]
    NoPresets {
        stage: &'static str,
        format: OutputFormat,
    },
    #[snafu(display("preset {preset_id} is not saved for the active format"))]
    PresetNotFound {
        stage: &'static str,
        preset_id: PresetId,
    },
    #[snafu(display("message {message_id} is not in the current conversation"))]
    MessageNotFound {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("only user messages can be edited and resent"))]
    NotAUserMessage {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("no conversation is selected"))]
    NoConversation { stage: &'static str },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat service call failed on `{stage}`: {source}"))]
    Api {
        stage: &'static str,
        source: ApiError,
    },
}

impl SessionError {
    /// Validation failures are rejected before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyPrompt { .. }
                | Self::Disconnected { .. }
                | Self::NoModel { .. }
                | Self::Busy { .. }
                | Self::UnsupportedFormat { .. }
                | Self::InvalidFormatSpec { .. }
                | Self::NoPresets { .. }
                | Self::MessageNotFound { .. }
                | Self::NotAUserMessage { .. }
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
