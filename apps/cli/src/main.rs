//! Lumo CLI - headless model download and credential management.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lumo_application::{ChatConfig, DownloadManager};
use lumo_models::ReqwestHttpClient;
use lumo_state::{DownloadStatus, LifecycleStore};
use lumo_storage::{CredentialSource, Database, SettingsCredentialSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod tracing_bus;

use tracing_bus::TracingEventBus;

/// Lumo - on-device chat model manager
#[derive(Parser)]
#[command(name = "lumo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: the platform data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where the model lives and whether it is present
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the Hugging Face access token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Download the configured model
    Download,

    /// Delete the downloaded model
    Delete,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Save a token
    Set { token: String },
    /// Print the saved token, masked
    Show,
    /// Remove the saved token
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info,lumo=debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(ChatConfig::default_path);
    let config = ChatConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Status { json } => status(&config, json),
        Commands::Token { action } => token(&config, action),
        Commands::Download => download(&config).await,
        Commands::Delete => delete(&config).await,
    }
}

fn credentials(config: &ChatConfig) -> anyhow::Result<SettingsCredentialSource> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(SettingsCredentialSource::new(Arc::new(db)))
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}{}", "*".repeat(token.chars().count().saturating_sub(4)))
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

fn status(config: &ChatConfig, json: bool) -> anyhow::Result<()> {
    let model_path = config.discover_model_path();
    let size = file_size(&model_path);
    let token_saved = credentials(config)?.read_token()?.is_some();

    if json {
        let report = serde_json::json!({
            "model_url": config.model_url,
            "model_path": model_path,
            "downloaded": size.is_some(),
            "size_bytes": size,
            "token_saved": token_saved,
            "database_path": config.database_path,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Model URL:  {}", config.model_url);
    println!("Model path: {}", model_path.display());
    match size {
        Some(bytes) => println!("Downloaded: yes ({bytes} bytes)"),
        None => println!("Downloaded: no"),
    }
    println!("Token:      {}", if token_saved { "saved" } else { "not set" });
    Ok(())
}

fn token(config: &ChatConfig, action: TokenAction) -> anyhow::Result<()> {
    let store = credentials(config)?;
    match action {
        TokenAction::Set { token } => {
            if token.trim().is_empty() {
                bail!("token must not be empty");
            }
            store.write_token(&token)?;
            println!("Token saved.");
        }
        TokenAction::Show => match store.read_token()? {
            Some(token) => println!("{}", mask(&token)),
            None => println!("No token saved."),
        },
        TokenAction::Clear => {
            store.clear_token()?;
            println!("Token cleared.");
        }
    }
    Ok(())
}

async fn download(config: &ChatConfig) -> anyhow::Result<()> {
    let destination = config.managed_model_path();
    let store = Arc::new(LifecycleStore::new(
        destination.clone(),
        Arc::new(TracingEventBus),
    ));
    let manager = DownloadManager::new(Arc::clone(&store), Arc::new(ReqwestHttpClient::new()))
        .with_credentials(Arc::new(credentials(config)?))
        .with_default_token(config.default_token.clone())
        .with_buffer_size(config.download_buffer_size);

    let mut updates = store.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_percent = None;
        while updates.changed().await.is_ok() {
            let download = updates.borrow_and_update().download;
            if let DownloadStatus::InProgress { progress } = download {
                let percent = (progress * 100.0) as u32;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    eprint!("\rDownloading... {percent:>3}%");
                }
            }
        }
    });

    let result = manager
        .download(&config.model_url, &destination, manager.resolve_token())
        .await;
    drop(manager);
    drop(store);
    reporter.await.ok();
    eprintln!();

    let path = result?;
    println!("Model saved to {}", path.display());
    Ok(())
}

async fn delete(config: &ChatConfig) -> anyhow::Result<()> {
    let path = config.discover_model_path();
    let removed = lumo_models::remove_artifact(&path)
        .await
        .with_context(|| format!("Failed to delete model file {}", path.display()))?;
    if removed {
        println!("Deleted {}", path.display());
    } else {
        println!("No model at {}", path.display());
    }
    Ok(())
}
