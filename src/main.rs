//! Maintenance CLI for a transcache SQLite store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use transcache::translate::cache::{CacheKey, CachedValue, PersistedBlob, TranslationCache, PERSIST_KEY};
use transcache::translate::normalize::prepare;
use transcache::{CacheSettings, DurableStore, EngineKind, Settings, SqliteStore, StoreError};

#[derive(Parser)]
#[command(name = "transcache", version, about = "Inspect and maintain a persistent translation cache")]
struct Cli {
    /// SQLite file holding the persisted cache.
    #[arg(long, default_value = "transcache.db")]
    db: PathBuf,

    /// Settings JSON; cache capacity and TTLs are taken from it.
    #[arg(long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print entry counts of the persisted blob.
    Stats,
    /// Look up one text as the service would key it.
    Lookup {
        text: String,
        #[arg(long, default_value = "google")]
        engine: EngineKind,
        #[arg(long, default_value = "auto")]
        source: String,
        #[arg(long, default_value = "en")]
        target: String,
    },
    /// Drop expired entries and trim to capacity.
    Prune {
        /// Overrides the configured capacity.
        #[arg(long)]
        max_entries: Option<usize>,
    },
    /// Delete the persisted blob.
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    transcache::init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] transcache::ConfigError),
    #[error("persisted cache is unreadable: {0}")]
    Blob(#[from] serde_json::Error),
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = match &cli.settings {
        Some(path) => Settings::load_from_file(path)?,
        None => Settings::default(),
    };
    let store = Arc::new(SqliteStore::open(&cli.db)?);

    match cli.command {
        Command::Stats => {
            let mut blobs = store.get(&[PERSIST_KEY.to_string()]).await?;
            let Some(raw) = blobs.remove(PERSIST_KEY) else {
                println!("no persisted cache");
                return Ok(());
            };
            let blob: PersistedBlob = serde_json::from_str(&raw)?;
            let stats = blob.stats(transcache::now_ms());
            println!(
                "{}",
                serde_json::json!({
                    "version": blob.version,
                    "updatedAt": blob.updated_at,
                    "entries": stats.entries,
                    "negative": stats.negative,
                    "expired": stats.expired,
                })
            );
        }
        Command::Lookup {
            text,
            engine,
            source,
            target,
        } => {
            let cache = TranslationCache::with_store(settings.cache.clone(), store).await;
            let key = CacheKey::new(engine, &source, &target, &prepare(&text));
            match cache.lookup(&key) {
                Some(CachedValue::Translation(translation)) => println!("{translation}"),
                Some(CachedValue::Negative) => println!("(no translation, cached)"),
                None => println!("(miss) {key}"),
            }
            cache.shutdown().await;
        }
        Command::Prune { max_entries } => {
            let cache_settings = CacheSettings {
                max_entries: max_entries.unwrap_or(settings.cache.max_entries),
                ..settings.cache.clone()
            };
            let cache = TranslationCache::with_store(cache_settings, store).await;
            cache.flush().await;
            info!(entries = cache.durable_len(), capacity = cache.capacity(), "pruned");
            cache.shutdown().await;
        }
        Command::Clear => {
            store.remove(&[PERSIST_KEY.to_string()]).await?;
            info!(db = %cli.db.display(), "persisted cache cleared");
        }
    }
    Ok(())
}
