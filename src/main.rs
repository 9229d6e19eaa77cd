use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::Row;
use tracing_subscriber::EnvFilter;

use plume_lib::id::new_uuid_v7;
use plume_lib::{db, migrate, server, AppState, Engine, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "plume", about = "Metadata-driven persistence server", version)]
struct Cli {
    /// SQLite database path. Overrides PLUME_DATABASE.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (the default).
    Serve {
        /// Listen port. Overrides PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Show applied schema migrations.
    Status,
}

fn database_path(cli: &Cli) -> PathBuf {
    cli.database
        .clone()
        .or_else(|| std::env::var_os("PLUME_DATABASE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("plume.sqlite3"))
}

async fn run(cli: Cli) -> Result<()> {
    let db_path = database_path(&cli);

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let port = port
                .or_else(|| {
                    std::env::var("PORT")
                        .ok()
                        .and_then(|p| p.parse().ok())
                })
                .unwrap_or(DEFAULT_PORT);

            let pool = db::open_pool(&db_path).await.context("open database")?;
            migrate::apply_migrations(&pool)
                .await
                .context("apply migrations")?;

            let engine = Arc::new(Engine::new(pool)?);
            {
                let mut conn = engine.pool.acquire().await?;
                engine.catalog.ensure_core(&mut *conn).await?;
            }

            let state = AppState::new(engine, new_uuid_v7());
            server::serve(state, port).await?;
        }
        Commands::Db(DbCommand::Status) => {
            let pool = db::open_pool(&db_path).await.context("open database")?;
            let rows = sqlx::query(
                "SELECT version, applied_at FROM schema_migrations ORDER BY version",
            )
            .fetch_all(&pool)
            .await
            .context("read schema_migrations")?;
            if rows.is_empty() {
                println!("no migrations applied");
            }
            for row in rows {
                let version: String = row.get("version");
                let applied_at: String = row.get("applied_at");
                println!("{version}  {applied_at}");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!(target = "plume", event = "fatal", error = %format!("{err:#}"));
        process::exit(1);
    }
}
