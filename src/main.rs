use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use finflow::ai::{HttpTextGenerator, TextGenerator};
use finflow::api::{create_router, AppState};
use finflow::config::Config;
use finflow::generator::StepGenerator;
use finflow::runner::{AgentPipeline, DagExecutor, RunRegistry};
use finflow::storage::SqliteStorage;
use finflow::stream::{StreamOrchestrator, StreamTiming};
use finflow::workflow::WorkflowService;

#[derive(Parser)]
#[command(name = "finflow", about = "Financial-analysis workflow backend", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Path to the SQLite database
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> finflow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("finflow=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load();

    match cli.command {
        Command::Server { port, host, database } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(database) = database {
                config.storage.database_path = Some(database);
            }
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> finflow::Result<()> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let storage = SqliteStorage::open(&db_path)?;
    let service = WorkflowService::new(storage.clone());
    let registry = RunRegistry::new();
    let ai: Arc<dyn TextGenerator> = Arc::new(HttpTextGenerator::new(&config.ai));

    let state = AppState {
        orchestrator: StreamOrchestrator::new(
            service.clone(),
            Arc::new(StepGenerator::new(ai.clone())),
            ai,
            StreamTiming::default(),
        ),
        pipeline: AgentPipeline::new(service.clone(), registry.clone()),
        dag: DagExecutor::new(service.clone(), registry.clone()),
        registry,
        service,
        storage,
    };

    let router = create_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr, database = %db_path.display(), "finflow server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
