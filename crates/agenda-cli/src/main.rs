use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use agenda_import::{
    apply_seeds, build_dashboard, AgendaConfig, DashboardQuery, ImportError, ImportPipeline,
    InputError, SeedFile,
};
use agenda_storage::{PgAppointmentStore, UploadStore};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "agenda")]
#[command(about = "Appointment import and dashboard tools")]
struct Cli {
    /// Log at debug level unless AGENDA_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import the events of an .ics file.
    Import {
        file: PathBuf,
        /// Print what would be inserted without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
    Dashboard {
        #[arg(long)]
        department: Option<Uuid>,
        #[arg(long)]
        reason: Option<Uuid>,
        /// First day, YYYY-MM-DD.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day (inclusive), YYYY-MM-DD.
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Register the departments and reasons listed in the seeds file.
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let config = AgendaConfig::from_env();

    match cli.command {
        Commands::Import { file, dry_run } => return import(&config, file, dry_run).await,
        Commands::Dashboard {
            department,
            reason,
            from,
            to,
        } => {
            let store = connect(&config).await?;
            let query = DashboardQuery {
                department_id: department,
                reason_id: reason,
                from,
                to,
            };
            let now = Utc::now().with_timezone(&config.timezone);
            let dashboard = build_dashboard(&store, &query, now)
                .await
                .context("building dashboard")?;
            println!("{}", serde_json::to_string_pretty(&dashboard)?);
        }
        Commands::Seed { file } => {
            let path = file.unwrap_or_else(|| config.seeds_file.clone());
            let seeds = SeedFile::load(&path).await?;
            let store = connect(&config).await?;
            let summary = apply_seeds(&store, &seeds).await.context("seeding reference data")?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn import(config: &AgendaConfig, file: PathBuf, dry_run: bool) -> Result<ExitCode> {
    let store = connect(config).await?;
    let pipeline = ImportPipeline::new(Arc::new(store), config.timezone);

    let uploads = UploadStore::new(config.uploads_dir.clone());
    let staged = match uploads.stage_file(&file).await {
        Ok(staged) => staged,
        Err(err) => return Ok(reject(ImportError::Input(InputError::Upload(err)))),
    };

    if dry_run {
        return match pipeline.plan_path(&staged.path).await {
            Ok(plan) => {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                Ok(ExitCode::SUCCESS)
            }
            Err(err) if err.is_client_error() => Ok(reject(err)),
            Err(err) => Err(err.into()),
        };
    }

    match pipeline.import_upload(&staged).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) if err.is_client_error() => Ok(reject(err)),
        Err(err) => Err(err.into()),
    }
}

fn reject(err: ImportError) -> ExitCode {
    eprintln!("{err}");
    ExitCode::from(2)
}

async fn connect(config: &AgendaConfig) -> Result<PgAppointmentStore> {
    PgAppointmentStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("AGENDA_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}
