use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use feedsync::config::Config;
use feedsync::feed::build_client;
use feedsync::storage::{Database, DatabaseError};
use feedsync::sync::{DeactivationMode, Pipeline};

#[derive(Parser, Debug)]
#[command(
    name = "feedsync",
    about = "Fetch every active RSS feed once and reconcile its items into the store"
)]
struct Args {
    /// Config file (missing file = defaults)
    #[arg(long, value_name = "FILE", default_value = "feedsync.toml")]
    config: PathBuf,

    /// Database file, overrides `database_path`
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    /// Maximum feeds fetched at once, overrides `concurrency`
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Per-feed deadline in seconds (0 disables), overrides `fetch_timeout_secs`
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Let deactivation race reconciliation instead of waiting for it
    #[arg(long)]
    concurrent_deactivation: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(database) = &self.database {
            config.database_path = database.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout) = self.timeout {
            config.fetch_timeout_secs = timeout;
        }
        if self.concurrent_deactivation {
            config.deactivation_mode = DeactivationMode::Concurrent;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate().context("Invalid command line override")?;

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!(
                "Error: Database '{}' is locked by another process. Please try again later.",
                config.database_path
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to open database '{}': {}",
                config.database_path,
                e
            ));
        }
    };

    let client =
        build_client(config.user_agent.as_deref()).context("Failed to build HTTP client")?;

    let pipeline = Pipeline::new(db.clone(), client, config.pipeline_options());
    let result = pipeline.run().await;
    db.close().await;

    let summary = result.context("Feed sync aborted")?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to encode summary")?
        );
    } else {
        print!("{}", summary);
    }

    Ok(())
}
