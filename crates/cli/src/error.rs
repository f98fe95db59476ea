use snafu::Snafu;
use structura_llm::ApiError;
use structura_storage::StorageError;

use crate::config::ConfigError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to load settings on `{stage}`: {source}"))]
    Config {
        stage: &'static str,
        source: ConfigError,
    },
    #[snafu(display("storage unavailable on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("api client unavailable on `{stage}`: {source}"))]
    Api {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
