mod cli;
mod command;
mod config;
mod error;
mod render;
mod repl;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use snafu::ResultExt;
use structura_core::{ChatSession, SessionOptions, SessionServices};
use structura_llm::ApiClient;
use structura_storage::{RestStorage, SqlitePreferences};
use tracing_subscriber::EnvFilter;

use crate::cli::Arguments;
use crate::config::AppConfig;
use crate::error::{ApiSnafu, AppResult, ConfigSnafu, StorageSnafu};
use crate::repl::Repl;

#[tokio::main]
async fn main() -> ExitCode {
    // Replies stream to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let arguments = Arguments::parse();
    match run(arguments).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(arguments: Arguments) -> AppResult<()> {
    let config_path = arguments
        .config
        .unwrap_or_else(AppConfig::default_config_path);
    let mut config = AppConfig::load(&config_path).context(ConfigSnafu {
        stage: "load-settings",
    })?;
    if let Some(api_url) = arguments.api_url {
        config = config.with_api_url(api_url);
    }
    tracing::info!(api_url = %config.api_url, preferences = ?config.preferences_path, "starting structura");

    let storage = RestStorage::new(config.api_url.clone(), config.token.clone()).context(
        StorageSnafu {
            stage: "build-rest-storage",
        },
    )?;
    let llm = ApiClient::new(config.api_url.clone(), config.token.clone()).context(ApiSnafu {
        stage: "build-api-client",
    })?;
    let preferences = SqlitePreferences::open(&config.preferences_path.to_string_lossy())
        .await
        .context(StorageSnafu {
            stage: "open-preferences",
        })?;

    let session = Arc::new(ChatSession::new(
        SessionServices {
            storage: Arc::new(storage),
            llm: Arc::new(llm),
            preferences: Arc::new(preferences),
        },
        SessionOptions {
            history_limit: config.history_limit,
        },
    ));
    session.start().await;

    Repl::new(session).run().await
}
