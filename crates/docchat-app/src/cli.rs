//! CLI argument definitions for the docchat binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docchat_core::config::DocchatConfig;

/// docchat - chat with your API documentation.
#[derive(Parser, Debug)]
#[command(name = "docchat", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,

    /// Data directory for the SQLite store.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Base URL of the indexing backend.
    #[arg(short = 'b', long = "backend-url", global = true)]
    pub backend_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP API (the default).
    Serve,
    /// Poll crawl progress for a backend document until it completes.
    Status {
        doc_id: String,
        /// Fetch the status once and exit.
        #[arg(long)]
        once: bool,
    },
    /// Ask the backend to crawl a documentation site, then follow its progress.
    Crawl {
        url: String,
        /// Owner recorded with the crawl.
        #[arg(long = "user-id", default_value = "cli")]
        user_id: String,
        /// Print the document id without waiting for the crawl.
        #[arg(long)]
        no_wait: bool,
    },
    /// Print the resolved configuration as TOML.
    Config {
        /// Also write it to the configuration file.
        #[arg(long)]
        write: bool,
    },
    /// Ask a question about a crawled document.
    Ask {
        doc_id: String,
        question: String,
        /// Number of passages the backend retrieves.
        #[arg(short = 'k', long = "top-k")]
        top_k: Option<u32>,
        /// Print the answer all at once instead of word by word.
        #[arg(long)]
        no_reveal: bool,
    },
}

impl CliArgs {
    /// The subcommand to run, `serve` when none was given.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > DOCCHAT_CONFIG env var > ~/.docchat/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        self.resolve_config_path_with(std::env::var("DOCCHAT_CONFIG").ok())
    }

    fn resolve_config_path_with(&self, env_value: Option<String>) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        match env_value {
            Some(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => default_config_path(),
        }
    }

    /// Resolve the data directory override, if one was given.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Write every flag that was given over the loaded configuration.
    pub fn apply_to(&self, config: &mut DocchatConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = self.resolve_data_dir() {
            config.general.data_dir = dir;
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(ref url) = self.backend_url {
            config.backend.base_url = url.trim_end_matches('/').to_string();
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".docchat").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".docchat").join("config.toml");
    }
    PathBuf::from("config.toml")
}
