//! Task Relay
//!
//! Orchestration middleware between intake channels and third-party task
//! backends: triage, reliable delivery, webhook intake, daily planning.

use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use task_relay::advisor::{Advisor, HttpAdvisor};
use task_relay::backends::BackendRegistry;
use task_relay::config::Config;
use task_relay::db::Database;
use task_relay::http::{build_router, AppState};
use task_relay::outbox::reclaim_leases;
use task_relay::scheduler::spawn_jobs;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Task Relay server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long)]
    database: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging based on --log option
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    match args.log.as_str() {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::load_or_default()
    };

    if let Some(db_path) = &args.database {
        config.server.db_path = db_path.into();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    config.validate()?;

    info!("Starting Task Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {:?}", config.server.db_path);

    let db = Database::open(&config.server.db_path)?;

    // Rows stuck inflight from a previous run go back to pending; the
    // idempotency keys make the re-dispatch safe.
    let reclaimed = reclaim_leases(&db)?;
    if reclaimed > 0 {
        info!("Recovered {} in-flight outbox rows from previous run", reclaimed);
    }

    let config = Arc::new(config);
    let registry = Arc::new(BackendRegistry::from_config(&config.backends));
    if registry.is_empty() {
        info!("No backends configured; outbox rows will dead-letter on dispatch");
    }

    let advisor: Option<Arc<dyn Advisor>> = if config.advisor.enabled {
        info!("Advisor enabled: {}", config.advisor.url);
        Some(Arc::new(HttpAdvisor::new(&config.advisor)))
    } else {
        None
    };

    let _jobs = spawn_jobs(db.clone(), Arc::clone(&config), Arc::clone(&registry));

    let state = AppState {
        db,
        config: Arc::clone(&config),
        backends: registry,
        advisor,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, build_router(state)).await?;

    Ok(())
}
