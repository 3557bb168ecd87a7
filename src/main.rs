use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod csv_transfer;
mod db;
mod filter;
mod http;
mod models;
mod stats;
mod store;

use config::{DuplicatePolicy, ServiceArgs, ServiceConfig};
use db::{LazyPool, PgStore};
use filter::AttendanceQuery;
use store::{AttendanceStore, MemoryStore};

#[derive(Parser)]
#[command(name = "attendance-tracker")]
#[command(about = "Student attendance tracking and statistics service", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", global = true, default_value_t = 5)]
    max_connections: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        /// Keep records in memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
        #[command(flatten)]
        service: ServiceArgs,
    },
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import attendance records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, value_enum, default_value_t = DuplicatePolicy::Allow)]
        duplicate_policy: DuplicatePolicy,
    },
    /// Export attendance records to a CSV file
    #[command(group(
        ArgGroup::new("scope")
            .args(["date", "from", "student"])
            .multiple(true)
            .required(true)
    ))]
    Export {
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<String>,
        #[arg(long, requires = "to")]
        from: Option<String>,
        #[arg(long, requires = "from")]
        to: Option<String>,
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "attendance.csv")]
        out: PathBuf,
    },
    /// Print attendance statistics as JSON
    Stats {
        #[arg(long, requires = "to")]
        from: Option<String>,
        #[arg(long, requires = "from")]
        to: Option<String>,
        #[arg(long)]
        full_history: bool,
        #[arg(long)]
        status: Option<String>,
        #[command(flatten)]
        service: ServiceArgs,
    },
    /// Show the number of classes held, or increment it
    Classes {
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        increment: Option<i64>,
    },
}

fn init_tracing() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?,
        )
        .init();
    Ok(())
}

fn pg_store(database_url: Option<String>, max_connections: u32) -> anyhow::Result<PgStore> {
    let database_url = database_url
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    Ok(PgStore::new(LazyPool::new(Some(database_url), max_connections)))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            in_memory,
            service,
        } => {
            let store: Arc<dyn AttendanceStore> = if in_memory {
                info!("using in-memory attendance store");
                Arc::new(MemoryStore::new())
            } else {
                if cli.database_url.is_none() {
                    tracing::warn!("DATABASE_URL is not set; storage requests will fail");
                }
                Arc::new(PgStore::new(LazyPool::new(
                    cli.database_url,
                    cli.max_connections,
                )))
            };

            let app = http::router(http::AppState::new(store, ServiceConfig::from(service)));
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!("listening on http://{bind}");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Commands::InitDb => {
            let store = pg_store(cli.database_url, cli.max_connections)?;
            let pool = store.pool().await.context("failed to connect to Postgres")?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let store = pg_store(cli.database_url, cli.max_connections)?;
            let pool = store.pool().await.context("failed to connect to Postgres")?;
            let inserted = db::seed(&pool).await?;
            println!("Seed data inserted ({inserted} new records).");
        }
        Commands::Import {
            csv,
            duplicate_policy,
        } => {
            let store = pg_store(cli.database_url, cli.max_connections)?;
            let file =
                File::open(&csv).with_context(|| format!("failed to open {}", csv.display()))?;
            let summary = csv_transfer::import_csv(&store, file, duplicate_policy).await?;
            println!(
                "Inserted {} records from {} ({} duplicates skipped).",
                summary.inserted,
                csv.display(),
                summary.skipped_duplicates
            );
        }
        Commands::Export {
            date,
            from,
            to,
            student,
            status,
            out,
        } => {
            let filter = AttendanceQuery {
                date,
                date_from: from,
                date_to: to,
                student_name: student,
                status,
                ..Default::default()
            }
            .into_list_filter()?;
            let store = pg_store(cli.database_url, cli.max_connections)?;
            let records = store.list_records(&filter).await?;
            let file = File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            csv_transfer::export_csv(&records, BufWriter::new(file))?;
            println!("Exported {} records to {}.", records.len(), out.display());
        }
        Commands::Stats {
            from,
            to,
            full_history,
            status,
            service,
        } => {
            let filter = AttendanceQuery {
                date_from: from,
                date_to: to,
                status,
                full_history: full_history.then(|| "true".to_string()),
                ..Default::default()
            }
            .into_stats_filter()?;
            let store = pg_store(cli.database_url, cli.max_connections)?;
            let config = ServiceConfig::from(service);
            let today: NaiveDate = Utc::now().date_naive();
            let report =
                stats::compute_statistics(&store, &filter, today, config.history_epoch).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Classes { increment } => {
            let store = pg_store(cli.database_url, cli.max_connections)?;
            let total = match increment {
                Some(by) => store.increment_class_count(by).await?,
                None => store.class_count_or_init().await?,
            };
            println!("Classes held: {total}");
        }
    }

    Ok(())
}
