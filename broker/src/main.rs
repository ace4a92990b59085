//! Broker Main Entry Point
//!
//! Usage:
//!
//! ```text
//! broker observe <facts.jsonl>      record one JSON fact per line
//! broker reindex <group-id>...      rebuild the index documents of clusters
//! ```

use std::env;

use broker::{BrokerError, Dependencies, StartupError};
use broker_shared::{GroupId, RawFact};
use dotenv::dotenv;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging.
fn init_tracing() -> Result<(), StartupError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("broker=info"));

    let json = env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .map_err(|e| StartupError::config(format!("Failed to initialize tracing: {}", e)))?;

        info!(
            service_name = "broker",
            service_version = env!("CARGO_PKG_VERSION"),
            "Tracing initialized with JSON format"
        );
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .try_init()
            .map_err(|e| StartupError::config(format!("Failed to initialize tracing: {}", e)))?;

        info!(
            service_name = "broker",
            service_version = env!("CARGO_PKG_VERSION"),
            "Tracing initialized with console output"
        );
    }

    Ok(())
}

enum Command {
    Observe(String),
    Reindex(Vec<GroupId>),
}

fn parse_args(args: &[String]) -> Result<Command, StartupError> {
    match args {
        [command, path] if command == "observe" => Ok(Command::Observe(path.clone())),
        [command, ids @ ..] if command == "reindex" && !ids.is_empty() => ids
            .iter()
            .map(|id| {
                id.parse::<GroupId>()
                    .map_err(|e| StartupError::config(format!("Invalid group id {}: {}", id, e)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Command::Reindex),
        _ => Err(StartupError::config(
            "usage: broker observe <facts.jsonl> | broker reindex <group-id>...",
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // Load environment variables from .env file
    dotenv().ok();

    init_tracing()?;

    let args: Vec<String> = env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let deps = match Dependencies::new().await {
        Ok(deps) => {
            info!("Dependencies initialized successfully");
            deps
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize dependencies");
            return Err(e);
        }
    };

    let mut failed_reindexes = 0usize;
    match command {
        Command::Observe(path) => {
            tokio::select! {
                result = observe_file(&deps, &path) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                }
            }
        }
        Command::Reindex(ids) => {
            for (id, result) in deps.broker.reindex_groups(&ids).await {
                match result {
                    Ok(report) => {
                        println!("{}", serde_json::to_string(&report).unwrap_or_default());
                    }
                    Err(e) => {
                        error!(group_id = %id, error = %e, "Failed to reindex group");
                        failed_reindexes += 1;
                    }
                }
            }
        }
    }

    let pending = deps.broker.pending_resyncs().await;
    if !pending.is_empty() {
        warn!(groups = pending.len(), "Retrying pending resyncs before exit");
        deps.retry
            .run(|| deps.broker.retry_pending_resyncs())
            .await?;
    }
    if failed_reindexes > 0 {
        return Err(StartupError::config(format!(
            "{} groups could not be reindexed",
            failed_reindexes
        )));
    }
    Ok(())
}

/// Record every fact of a JSON-lines file.
///
/// Conflicts and index failures are retried per fact; a malformed line is
/// logged and skipped.
async fn observe_file(deps: &Dependencies, path: &str) -> Result<(), BrokerError> {
    let file = File::open(path)
        .await
        .map_err(|e| BrokerError::validation(format!("Failed to open {}: {}", path, e)))?;
    let mut lines = BufReader::new(file).lines();

    let mut line_number = 0usize;
    let mut observed = 0usize;
    let mut skipped = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| BrokerError::validation(format!("Failed to read {}: {}", path, e)))?
    {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawFact = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping malformed fact");
                skipped += 1;
                continue;
            }
        };

        let outcome = deps
            .retry
            .run(|| deps.broker.observe_raw(raw.clone()))
            .await;
        match outcome {
            Ok(outcome) => {
                observed += 1;
                if let Err(e) = &outcome.resync {
                    warn!(line = line_number, error = %e, "Fact recorded but not indexed");
                }
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(line = line_number, error = %e, "Fact rejected");
                skipped += 1;
            }
        }
    }

    info!(observed, skipped, "Finished observing facts");
    Ok(())
}
