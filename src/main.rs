use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use leadflow::{
    config::{ConfigManager, EnvConfigManager, Settings},
    flow::{DirFlowStore, FlowGraph, FlowStore, load_flow_from_file},
    logger::{EngineMetrics, init_tracing},
    platform::{CrmClient, DialerClient, HttpCrmClient, HttpDialerClient, PlatformBatchHandler},
    schema::{flow_schema, write_schema},
    service::LeadflowService,
};
use leadflow_bus::{MessageBus, NatsBus};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "leadflow",
    about = "Lead workflow engine between the CRM and the dialer",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until Ctrl-C
    Run(RunArgs),

    /// Check that a flow file parses and forms a valid graph
    Validate { file: PathBuf },

    /// Emit JSON Schema for flow files
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log level override (e.g. error, warn, info, debug, trace); defaults to LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    /// Write rolling log files here instead of stdout
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Dotenv file with configuration
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Directory to write the schema files into; prints to stdout when omitted
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { file } => {
            let flow = load_flow_from_file(&file)?;
            let graph = FlowGraph::build(&flow.graph)?;
            println!(
                "Flow `{}` is valid: {} nodes, {} edges{}",
                flow.id,
                graph.node_count(),
                graph.edge_count(),
                if flow.is_active { "" } else { " (inactive)" }
            );
            Ok(())
        }
        Commands::Schema(args) => {
            match args.out {
                Some(dir) => {
                    for path in write_schema(&dir)? {
                        println!("Wrote {}", path.display());
                    }
                }
                None => println!("{}", serde_json::to_string_pretty(&flow_schema()?)?),
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = ConfigManager(EnvConfigManager::new(args.env_file.clone()));
    let settings = Settings::load(&config).await.context("invalid configuration")?;
    let log_level = args.log_level.unwrap_or_else(|| settings.log_level.clone());
    let telemetry = init_tracing(&log_level, args.log_dir.as_deref(), args.otel_endpoint.as_deref())?;

    info!(nats = %settings.nats_url, flows_dir = %settings.flows_dir.display(), "leadflow starting up");

    let nats = Arc::new(
        NatsBus::connect(&settings.nats_url)
            .await
            .context("connecting to the message bus")?,
    );
    let bus: Arc<dyn MessageBus> = nats.clone();

    let store = Arc::new(
        DirFlowStore::watch(&settings.flows_dir, Duration::from_secs(2))
            .await
            .context("loading flows")?,
    );
    info!(flows = store.list_active_flows().await?.len(), "flows loaded");

    let crm: Option<Arc<dyn CrmClient>> =
        match HttpCrmClient::new(&settings.crm_base_url, &settings.crm_access_token) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                warn!(error = %err, "CRM updates will fail");
                None
            }
        };
    let dialer: Option<Arc<dyn DialerClient>> =
        match HttpDialerClient::new(&settings.dialer_api_url, &settings.dialer_api_key) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                warn!(error = %err, "dialer pushes will fail");
                None
            }
        };
    let handler = Arc::new(PlatformBatchHandler::new(crm, dialer));

    let service = LeadflowService::start(
        bus,
        store.clone(),
        handler,
        &settings,
        None,
        EngineMetrics::new(),
    )
    .await?;

    info!("leadflow running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    info!("leadflow shutting down");

    let result = service.shutdown(settings.shutdown_grace).await;
    store.shutdown();
    nats.close().await;
    telemetry.shutdown();
    result
}
