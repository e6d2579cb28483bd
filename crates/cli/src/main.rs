//! tiercache maintenance CLI.
//!
//! Operates directly on the configured database files. Configuration comes
//! from `TIERCACHE_*` environment variables and `TIERCACHE_CONFIG_FILE`.
//! Logging goes to stderr so stdout carries only command output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tiercache_core::cache::{KvStore, SnapshotMirror};
use tiercache_core::session::{ChatHistory, Session, load_snapshot};
use tiercache_core::{CacheConfig, SessionStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tiercache")]
#[command(about = "Inspect and maintain tiercache databases")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Row count for a runtime cache table
    Stats {
        /// Table name in the runtime database
        #[arg(long)]
        table: String,
    },
    /// Trim a runtime cache table to its most recent rows
    Prune {
        #[arg(long)]
        table: String,
        /// Rows to keep (defaults to the configured row budget)
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Chat session maintenance
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List stored sessions, most recent first
    List,
    /// Write the JSON snapshot from the session database
    Export,
    /// Merge the JSON snapshot into the session database
    Import,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = CacheConfig::load().context("failed to load configuration")?;
    tracing::debug!(data_dir = %config.data_dir.display(), "Loaded configuration");

    match cli.command {
        Commands::Stats { table } => stats(&config, &table),
        Commands::Prune { table, max_rows } => prune(&config, &table, max_rows),
        Commands::Sessions { command } => match command {
            SessionCommands::List => list_sessions(&config),
            SessionCommands::Export => export_sessions(&config),
            SessionCommands::Import => import_sessions(&config),
        },
    }
}

fn stats(config: &CacheConfig, table: &str) -> Result<()> {
    let store = KvStore::from_config(config, table)?;
    let rows = store.count().with_context(|| format!("failed to count rows in {table}"))?;
    println!(
        "{}",
        json!({
            "path": store.storage().path().display().to_string(),
            "table": table,
            "rows": rows,
            "max_rows": store.options().max_rows,
        })
    );
    Ok(())
}

fn prune(config: &CacheConfig, table: &str, max_rows: Option<usize>) -> Result<()> {
    let store = KvStore::from_config(config, table)?;
    let keep = max_rows.unwrap_or(store.options().max_rows);
    let deleted = store.prune(keep).with_context(|| format!("failed to prune {table}"))?;
    tracing::info!(table, keep, deleted, "Pruned table");
    println!("{}", json!({ "table": table, "kept": keep, "deleted": deleted }));
    Ok(())
}

fn list_sessions(config: &CacheConfig) -> Result<()> {
    let sessions = SessionStore::from_config(config).load_all().context("failed to load sessions")?;
    for session in &sessions {
        println!(
            "{}",
            json!({
                "id": session.id,
                "title": session.title,
                "updated_at": session.updated_at,
                "messages": session.messages.len(),
            })
        );
    }
    Ok(())
}

fn export_sessions(config: &CacheConfig) -> Result<()> {
    let history = ChatHistory::open(config);
    history.export_snapshot().context("failed to write snapshot")?;
    println!("{}", json!({ "path": history.mirror().path().display().to_string(), "sessions": history.len() }));
    Ok(())
}

fn import_sessions(config: &CacheConfig) -> Result<()> {
    let mirror = SnapshotMirror::new(config.chat_snapshot_path(), config.mirror_interval());
    let Some(value) = mirror.load::<serde_json::Value>().context("failed to read snapshot")? else {
        anyhow::bail!("no snapshot at {}", mirror.path().display());
    };
    let loaded = load_snapshot(value).context("unsupported snapshot")?;

    let changed: Vec<&Session> = loaded.sessions.iter().collect();
    let report = SessionStore::from_config(config)
        .apply_deltas(&changed, &[], false)
        .context("failed to import sessions")?;
    println!(
        "{}",
        json!({
            "sessions": loaded.sessions.len(),
            "migrated_from": loaded.migrated_from,
            "report": report,
        })
    );
    Ok(())
}
