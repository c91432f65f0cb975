use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use storyloom_core::ai::OpenAiClient;
use storyloom_core::config::Config;
use storyloom_core::failures::FailureRecorder;
use storyloom_core::media::{
    ImageGenerator, LocalMediaStore, SpeechSynthesizer, VideoComposer,
};
use storyloom_core::orchestrator::StoryOrchestrator;
use storyloom_core::persistence::PersistenceCoordinator;
use storyloom_core::queue::QueueChoice;
use storyloom_core::repository::{create_pool, PostgresDb, PostgresJobStore};
use storyloom_core::worker::{MediaHandlers, Worker};

#[derive(Parser)]
#[command(
    name = "storyloom",
    about = "Storyloom - asynchronous generation pipeline for illustrated children's stories",
    version
)]
struct Cli {
    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the dispatch API server
    Api {
        #[arg(long, default_value = "0.0.0.0", help = "Bind address")]
        host: String,

        #[arg(short, long, default_value_t = 8080, help = "Bind port")]
        port: u16,
    },

    /// Start the generation worker
    Worker,

    /// Check database and queue connectivity
    Health,

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    info!("Starting storyloom v{}", storyloom_core::VERSION);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = match cli.command {
        Some(Commands::Api { host, port }) => storyloom_api::server::run(config, &host, port)
            .await
            .map_err(anyhow::Error::new),
        Some(Commands::Worker) | None => run_worker(config).await,
        Some(Commands::Health) => run_health(config).await,
        Some(Commands::Config) => run_config(config),
    };

    if let Err(e) = outcome {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let log_directive = if verbose {
        "storyloom=debug,tower_http=debug,sqlx=warn"
    } else {
        "storyloom=info,tower_http=warn,sqlx=error"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_directive)),
        )
        .init();
}

/// Build process-scoped resources and run the worker loop until interrupted
async fn run_worker(config: Config) -> Result<()> {
    let database_url = config
        .database
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL (or POSTGRES_URL) is required"))?;

    let pool = create_pool(database_url, config.database.pool_size).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let store = Arc::new(PostgresJobStore::new(PostgresDb::new(pool.clone())));
    let queue = storyloom_core::queue::connect(&config.queue).await?;

    let recorder = Arc::new(FailureRecorder::new(
        store.clone(),
        config.notifications.clone(),
    ));

    let ai = Arc::new(OpenAiClient::new(config.ai.clone())?);
    let orchestrator = StoryOrchestrator::new(ai, recorder.clone());
    let persistence = PersistenceCoordinator::new(
        store.clone(),
        queue.clone(),
        recorder.clone(),
        config.skip_persistence,
    );

    let media_store = Arc::new(LocalMediaStore::new(&config.media)?);
    let media = MediaHandlers {
        images: ImageGenerator::new(
            config.media.image_api_key.clone(),
            config.ai.base_url.clone(),
        ),
        speech: SpeechSynthesizer::new(
            config.media.tts_api_key.clone(),
            config.ai.base_url.clone(),
            media_store.clone(),
        ),
        composer: VideoComposer::new(config.media.video_fps),
        store: media_store,
    };

    let worker = Arc::new(Worker::new(
        store,
        queue,
        orchestrator,
        persistence,
        recorder,
        media,
        config.worker.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Interrupt -> stop polling, drain, close resources.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    // Reconciler: re-push pending jobs that outlived the staleness window.
    let reconciler = worker.clone();
    let mut reconcile_shutdown = shutdown_rx.clone();
    let reconcile_interval = Duration::from_secs(config.worker.reconcile_interval_secs);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reconcile_shutdown.changed() => break,
                _ = tokio::time::sleep(reconcile_interval) => {
                    if let Err(e) = reconciler.reconcile_once().await {
                        error!("Reconcile pass failed: {}", e);
                    }
                }
            }
        }
    });

    worker.run(shutdown_rx).await;

    pool.close().await;
    info!("Worker exited cleanly");
    Ok(())
}

/// Connectivity check for deploy probes
async fn run_health(config: Config) -> Result<()> {
    match &config.database.url {
        Some(url) => {
            let pool = create_pool(url, 1).await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            println!("database: ok");
            pool.close().await;
        }
        None => println!("database: not configured"),
    }

    match QueueChoice::from_config(&config.queue) {
        QueueChoice::ListBroker { .. } => {
            storyloom_core::queue::connect(&config.queue).await?;
            println!("queue: list broker ok");
        }
        QueueChoice::RestPush { .. } => println!("queue: rest push (push-only)"),
        QueueChoice::Noop => println!("queue: not configured"),
    }

    Ok(())
}

/// Print the resolved configuration with secrets masked
fn run_config(config: Config) -> Result<()> {
    let mut value = serde_json::to_value(&config)?;

    for key_path in [
        ["ai", "api_key"],
        ["queue", "rest_token"],
        ["media", "image_api_key"],
        ["media", "tts_api_key"],
    ] {
        if let Some(slot) = value
            .get_mut(key_path[0])
            .and_then(|section| section.get_mut(key_path[1]))
        {
            if slot.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                *slot = serde_json::json!("***");
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
