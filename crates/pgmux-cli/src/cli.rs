//! pgmux - operator CLI for the pgmux connection manager
//!
//! # Usage
//!
//! ```text
//! pgmux ping postgres://app@localhost/main
//! pgmux exec postgres://app@localhost/main "UPDATE jobs SET state = 'done'" --write
//! ```

mod logging;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use pgmux_connection::{ClientRef, PoolRegistry};
use pgmux_core::{QueryResult, Value};
use pgmux_driver_postgres::PostgresConnector;

use crate::logging::LoggingConfig;

#[derive(Parser)]
#[command(name = "pgmux", version, about = "Check and exercise pgmux connection pools")]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "PGMUX_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run `SELECT 1` through the manager and report pool statistics
    Ping {
        /// Connection string
        url: String,
    },
    /// Run one statement and print the result as JSON
    Exec {
        /// Connection string
        url: String,

        /// Statement to run
        sql: String,

        /// Run inside BEGIN/COMMIT with transient-failure retry
        #[arg(long)]
        write: bool,

        /// Database overriding the one in the connection string
        #[arg(long)]
        database: Option<String>,

        /// Application name reported to the server
        #[arg(long)]
        service: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.log_json {
        LoggingConfig::json()
    } else {
        LoggingConfig::default()
    };
    logging::init(config)?;

    let registry = PoolRegistry::from_env(Arc::new(PostgresConnector::new()))?;
    let outcome = run(&registry, cli.command).await;
    registry.shutdown().await;
    outcome
}

async fn run(registry: &PoolRegistry, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ping { url } => {
            let client = registry.acquire(&url, None, None)?;
            let outcome = ping(&client).await;
            close(&client).await;
            outcome
        }
        Command::Exec {
            url,
            sql,
            write,
            database,
            service,
        } => {
            let client = registry.acquire(&url, database.as_deref(), service.as_deref())?;
            let outcome = exec(&client, &sql, write).await;
            close(&client).await;
            outcome
        }
    }
}

async fn ping(client: &ClientRef) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let result = client
        .mgr()
        .retry(None, None, |executor| async move {
            executor.execute("SELECT 1", &[]).await
        })
        .await?;

    let ok = result.first().and_then(|row| row.get(0)) == Some(&Value::Int32(1));
    let stats = client.handle().stats();
    let report = serde_json::json!({
        "ok": ok,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "pool": {
            "total": stats.total,
            "idle": stats.idle,
            "active": stats.active,
            "waiting": stats.waiting,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    anyhow::ensure!(ok, "unexpected reply to SELECT 1");
    Ok(())
}

async fn exec(client: &ClientRef, sql: &str, write: bool) -> anyhow::Result<()> {
    let mgr = client.mgr();
    let run = |executor: Arc<dyn pgmux_core::Executor>| async move {
        executor.execute(sql, &[]).await
    };

    let result = if write {
        mgr.write(None, None, run).await?
    } else {
        mgr.retry(None, None, run).await?
    };

    println!("{}", serde_json::to_string_pretty(&result_json(&result))?);
    Ok(())
}

fn result_json(result: &QueryResult) -> serde_json::Value {
    serde_json::json!({
        "count": result.count,
        "columns": result.columns,
        "rows": result.rows.iter().map(|row| row.to_json()).collect::<Vec<_>>(),
    })
}

async fn close(client: &ClientRef) {
    if let Some(teardown) = client.close() {
        if let Err(e) = teardown.await {
            tracing::warn!(error = %e, "pool teardown task failed");
        }
    }
}
