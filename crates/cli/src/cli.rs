use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Arguments {
    /// Specify path for settings file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Base URL of the chat API, overriding the settings file.
    #[arg(long)]
    pub api_url: Option<String>,
}
