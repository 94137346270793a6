use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tracker::config::AppConfig;
use tracker::db::TrackerDb;
use tracker::server;

#[derive(Parser)]
#[command(name = "tracker")]
#[command(version, about = "Issue tracker with live notifications and AI triage hints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tracker server
    Serve {
        /// Port to serve on (overrides TRACKER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides TRACKER_DATABASE_PATH)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Directory for issue attachments (overrides TRACKER_UPLOADS_DIR)
        #[arg(long)]
        uploads_dir: Option<PathBuf>,

        /// Enable dev mode (permissive CORS for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Initialize the database and exit
    InitDb {
        /// Database path (overrides TRACKER_DATABASE_PATH)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            uploads_dir,
            dev,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db_path) = db_path {
                config.database_path = db_path;
            }
            if let Some(uploads_dir) = uploads_dir {
                config.uploads_dir = uploads_dir;
            }
            if dev {
                config.dev_mode = true;
            }
            server::start_server(config).await?;
        }
        Commands::InitDb { db_path } => {
            if let Some(db_path) = db_path {
                config.database_path = db_path;
            }
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create database directory")?;
                }
            }
            TrackerDb::new(&config.database_path).context("Failed to initialize database")?;
            println!("Database initialized at {}", config.database_path.display());
        }
    }

    Ok(())
}
