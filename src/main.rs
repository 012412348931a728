//! dbconn - Main entry point.
//!
//! Opens one verified, pooled connection from a YAML file and/or `DB_*`
//! environment variables, runs a single command through it and closes it.

use dbconn::config::{Cli, Command};
use dbconn::models::QueryParam;
use dbconn::{ConnectionManager, DbError};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));

    // Logs go to stderr so stdout carries only results
    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn parse_params(raw: &[String]) -> Vec<QueryParam> {
    raw.iter().map(|value| QueryParam::infer(value)).collect()
}

async fn run(manager: &ConnectionManager, command: &Command) -> Result<(), DbError> {
    match command {
        Command::Ping => {
            manager.ping().await?;
            let report = serde_json::json!({
                "target": manager.target(),
                "state": manager.state().as_str(),
                "pool": manager.stats(),
            });
            println!("{report}");
        }
        Command::Query { sql, params } => {
            let mut rows = manager.query(sql, &parse_params(params)).await?;
            for row in rows.by_ref() {
                println!("{}", serde_json::Value::Object(row.to_json_map()));
            }
            rows.release().await;
        }
        Command::Exec { sql, params } => {
            let summary = manager.execute(sql, &parse_params(params)).await?;
            println!("{}", serde_json::json!(summary));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();

    init_tracing(&cli);

    info!("Starting dbconn v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.database_config()?;
    let manager = ConnectionManager::new(config);
    if let Err(e) = manager.open().await {
        error!(error = %e, suggestion = ?e.suggestion(), "Failed to open database connection");
        return Err(e.into());
    }

    let result = run(&manager, &cli.command).await;
    manager.close().await?;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        return Err(e.into());
    }
    Ok(())
}
