//! docchat application binary - composition root.
//!
//! 1. Load configuration from TOML, env vars and CLI flags
//! 2. Initialize tracing
//! 3. Run the chosen subcommand: serve the HTTP API, or talk to the
//!    indexing backend directly (status, crawl, ask)

mod cli;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_stream::StreamExt;

use docchat_api::{start_server, AppState};
use docchat_backend::{
    reveal_words, BackendClient, ChatQuery, CrawlRequest, ProgressReport, StatusPoller,
};
use docchat_core::config::DocchatConfig;
use docchat_core::error::DocchatError;
use docchat_storage::Database;

use crate::cli::{CliArgs, Command};

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Open the store and serve the API until the listener fails.
async fn serve(config: DocchatConfig) -> Result<(), DocchatError> {
    let data_dir = config.resolved_data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let db_path = config.database_path();
    let database = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let backend = BackendClient::new(config.backend.base_url.clone())?;
    tracing::info!(backend = %backend.base_url(), "Indexing backend configured");

    let state = AppState::new(config, database, backend);
    start_server(state).await
}

async fn status(config: &DocchatConfig, doc_id: String, once: bool) -> Result<(), DocchatError> {
    let backend = BackendClient::new(config.backend.base_url.clone())?;
    if once {
        let status = backend.document_status(&doc_id).await?;
        println!("{}", ProgressReport::from(&status).render());
        return Ok(());
    }

    let poller = StatusPoller::new(
        Arc::new(backend),
        Duration::from_millis(config.poller.interval_ms),
    );
    let handle = poller.start(doc_id.clone(), |report| println!("{}", report.render()));
    match handle.completed().await {
        Some(_) => Ok(()),
        None => Err(DocchatError::Backend(format!(
            "Polling for {} stopped before completion",
            doc_id
        ))),
    }
}

async fn crawl(
    config: &DocchatConfig,
    url: String,
    user_id: String,
    wait: bool,
) -> Result<(), DocchatError> {
    let backend = BackendClient::new(config.backend.base_url.clone())?;
    let accepted = backend
        .crawl_docs(&CrawlRequest {
            base_url: url,
            user_id,
        })
        .await?;
    println!("{}", accepted.doc_id);
    if !wait {
        return Ok(());
    }
    status(config, accepted.doc_id, false).await
}

/// Print the effective configuration, optionally saving it.
fn show_config(
    config: &DocchatConfig,
    path: &std::path::Path,
    write: bool,
) -> Result<(), DocchatError> {
    let rendered =
        toml::to_string_pretty(config).map_err(|e| DocchatError::Config(e.to_string()))?;
    println!("{}", rendered);
    if write {
        config.save(path)?;
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}

async fn ask(
    config: &DocchatConfig,
    doc_id: String,
    question: String,
    top_k: Option<u32>,
    reveal: bool,
) -> Result<(), DocchatError> {
    let backend = BackendClient::new(config.backend.base_url.clone())?;
    let answer = backend
        .chat(&ChatQuery {
            doc_id,
            query: question,
            top_k: top_k.unwrap_or(config.backend.default_top_k),
        })
        .await?;

    if !reveal || config.chat.reveal_delay_ms == 0 {
        println!("{}", answer.answer);
        return Ok(());
    }

    let mut words = reveal_words(
        &answer.answer,
        Duration::from_millis(config.chat.reveal_delay_ms),
    );
    let mut stdout = std::io::stdout();
    while let Some(prefix) = words.next().await {
        write!(stdout, "\r{}", prefix)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = match DocchatConfig::load(&config_file) {
        Ok(config) => (config, None),
        Err(e) => (DocchatConfig::default(), Some(e)),
    };
    config.apply_env_overrides();
    args.apply_to(&mut config);
    config.clamp_intervals();

    // Tracing.
    init_tracing(&config.general.log_level);
    match load_error {
        Some(e) if config_file.exists() => {
            tracing::warn!(path = %config_file.display(), error = %e, "Config unreadable, using defaults")
        }
        Some(_) => tracing::info!(path = %config_file.display(), "No config file, using defaults"),
        None => tracing::info!(path = %config_file.display(), "Configuration loaded"),
    }

    let result = match args.command() {
        Command::Serve => {
            tracing::info!("Starting docchat v{}", env!("CARGO_PKG_VERSION"));
            serve(config).await
        }
        Command::Status { doc_id, once } => status(&config, doc_id, once).await,
        Command::Crawl {
            url,
            user_id,
            no_wait,
        } => crawl(&config, url, user_id, !no_wait).await,
        Command::Config { write } => show_config(&config, &config_file, write),
        Command::Ask {
            doc_id,
            question,
            top_k,
            no_reveal,
        } => ask(&config, doc_id, question, top_k, !no_reveal).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
