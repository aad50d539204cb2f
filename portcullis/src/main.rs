use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use portcullis::{
    AttemptRecord, AttemptRepository, Namespace, SqliteAttemptRepository, ThrottleConfig,
    ThrottleDecision,
};
use portcullis_core::{AttemptTracker, ThrottlePolicy};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Command line interface for Portcullis
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database connection string
    #[arg(long, env = "PORTCULLIS_DATABASE_URL")]
    db_url: String,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(clap::Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Show the tracked state of an identity
    Status {
        /// `ip` or `username`
        namespace: Namespace,
        identity: String,
    },
    /// Clear an identity's record, lifting any lock
    Unlock {
        /// `ip` or `username`
        namespace: Namespace,
        identity: String,
    },
    /// Remove records that no longer affect any decision
    Sweep,
    /// Print version information
    Version,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    namespace: Namespace,
    identity: &'a str,
    decision: ThrottleDecision,
    record: Option<AttemptRecord>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), portcullis_core::Error> {
    if let Commands::Version = cli.command {
        println!("Portcullis v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let repository = Arc::new(SqliteAttemptRepository::connect(&cli.db_url).await?);
    let tracker = AttemptTracker::new(
        Arc::clone(&repository),
        ThrottlePolicy::new(ThrottleConfig::from_env()?)?,
    );
    let now = tracker.now();

    match cli.command {
        Commands::Migrate => {
            println!("Running migrations...");
            repository.migrate().await?;
        }
        Commands::Status {
            namespace,
            identity,
        } => {
            let decision = tracker.check_identity(namespace, &identity, now).await?;
            let record = repository
                .find(namespace, &identity)
                .await?
                .map(|stored| stored.record);
            let report = StatusReport {
                namespace,
                identity: &identity,
                decision,
                record,
            };
            let json = serde_json::to_string_pretty(&report).map_err(|e| {
                portcullis_core::error::ValidationError::InvalidField(e.to_string())
            })?;
            println!("{json}");
        }
        Commands::Unlock {
            namespace,
            identity,
        } => {
            if tracker.unlock(namespace, &identity, now).await? {
                println!("Unlocked {namespace} {identity}");
            } else {
                println!("{namespace} {identity} was not locked; record cleared");
            }
        }
        Commands::Sweep => {
            let removed = tracker.sweep(now).await?;
            println!("Removed {removed} stale records");
        }
        Commands::Version => {}
    }

    Ok(())
}
