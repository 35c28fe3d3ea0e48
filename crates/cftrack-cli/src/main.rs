use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cftrack_adapters::{CodeforcesClient, FixtureJudgeClient, JudgeClient};
use cftrack_storage::{MemoryStore, PgStore, RecordStore};
use cftrack_sync::{
    load_schedule_presets, ScheduleController, SyncConfig, SyncService, TracingMailer,
};
use cftrack_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cftrack")]
#[command(about = "Codeforces student progress tracker")]
struct Cli {
    /// Serve judge data from `<dir>/<handle>.json` instead of the live API.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API (and the scheduled sync when enabled).
    Serve,
    /// Sync every student, or one with `--student`.
    Sync {
        #[arg(long)]
        student: Option<Uuid>,
    },
    /// Apply database migrations.
    Migrate,
    /// Print the rating leaderboard.
    Leaderboard {
        #[arg(long, default_value_t = cftrack_analytics::DEFAULT_LEADERBOARD_SIZE)]
        limit: usize,
    },
}

fn init_tracing() {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("cftrack=info"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

async fn connect_pg(config: &SyncConfig) -> Result<PgStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for this command")?;
    PgStore::connect(url).await
}

fn build_judge(config: &SyncConfig, fixtures: Option<PathBuf>) -> Result<Arc<dyn JudgeClient>> {
    match fixtures {
        Some(dir) => {
            info!(dir = %dir.display(), "using fixture judge client");
            Ok(Arc::new(FixtureJudgeClient::new(dir)))
        }
        None => Ok(Arc::new(CodeforcesClient::from_config(
            config.http_client_config(),
            config.api_base.clone(),
        )?)),
    }
}

fn build_service(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    judge: Arc<dyn JudgeClient>,
) -> Arc<SyncService> {
    Arc::new(SyncService::new(
        store,
        judge,
        Arc::new(TracingMailer),
        config.settings(),
    ))
}

async fn serve(config: SyncConfig, fixtures: Option<PathBuf>) -> Result<()> {
    let store: Arc<dyn RecordStore> = match config.database_url {
        Some(_) => Arc::new(connect_pg(&config).await?),
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let service = build_service(&config, store, build_judge(&config, fixtures)?);

    let schedule = Arc::new(
        ScheduleController::new(service.clone())
            .await
            .context("creating scheduler")?,
    );
    if config.scheduler_enabled {
        schedule
            .reconfigure(&config.sync_cron)
            .await
            .with_context(|| format!("scheduling sync with cron {}", config.sync_cron))?;
    }
    let presets = load_schedule_presets(&config.workspace_root).await?;

    cftrack_web::serve(AppState::new(service, schedule, presets), config.web_port).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, cli.fixtures).await?,
        Commands::Sync { student } => {
            let store = Arc::new(connect_pg(&config).await?);
            let service = build_service(&config, store, build_judge(&config, cli.fixtures)?);
            match student {
                Some(id) => {
                    let student = service.sync_one(id).await?;
                    println!(
                        "synced {}: rating={} max={} solved={} streak={}",
                        student.handle,
                        student.current_rating,
                        student.max_rating,
                        student.total_problems_solved,
                        student.current_streak
                    );
                }
                None => {
                    let report = service.sync_all().await?;
                    println!(
                        "sync complete: run_id={} synced={} blocked={} failed={}",
                        report.run_id,
                        report.succeeded(),
                        report.blocked(),
                        report.failed()
                    );
                }
            }
        }
        Commands::Migrate => {
            connect_pg(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Leaderboard { limit } => {
            let store = Arc::new(connect_pg(&config).await?);
            let service = build_service(&config, store, build_judge(&config, cli.fixtures)?);
            for row in service.get_leaderboard(limit).await? {
                println!(
                    "{:>3}. {:<24} {:<20} {:>5} (max {:>5}) {:>4} solved",
                    row.rank,
                    row.name,
                    row.handle,
                    row.current_rating,
                    row.max_rating,
                    row.total_problems_solved
                );
            }
        }
    }

    Ok(())
}
