//! Requisition enricher - Main Entry Point
//!
//! Runs the HTTP service, processes a single workbook from the command line,
//! or validates the configuration.

use clap::{Parser, Subcommand};
use requisition_enricher::cache::LookupCache;
use requisition_enricher::config::AppConfig;
use requisition_enricher::gateway::{GatewayClient, GatewayClientConfig, RegistryGateway};
use requisition_enricher::observability::logging::{init_logging, parse_level, LogFormat};
use requisition_enricher::observability::init_default_logging;
use requisition_enricher::pipeline::EnrichmentPipeline;
use requisition_enricher::progress::LogProgress;
use requisition_enricher::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Lab requisition enrichment against the medical registry
#[derive(Parser)]
#[command(name = "requisition-enricher")]
#[command(about = "Reconciles lab test requisition spreadsheets against a medical registry")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ENRICHER_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve,
    /// Enrich one workbook and write the report
    Process {
        /// Requisition workbook (.xlsx)
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Where to copy the finished report
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(parse_level("DEBUG"), log_format(), false),
        _ => init_logging(parse_level("TRACE"), log_format(), true),
    }

    info!("Starting requisition enricher v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => run_server(config).await,
        Commands::Process { input, output } => process_workbook(config, input, output).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()))
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AppConfig, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    let default_paths = ["enricher.toml", "config/enricher.toml"];
    for path in default_paths.iter().map(PathBuf::from) {
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create enricher.toml".into())
}

fn build_gateway(
    config: &AppConfig,
) -> Result<Arc<dyn RegistryGateway>, Box<dyn std::error::Error + Send + Sync>> {
    let client_config = GatewayClientConfig::from_app_config(config)?;
    info!("Registry gateway endpoint: {}", client_config.endpoint_url);
    Ok(Arc::new(GatewayClient::new(client_config)?))
}

async fn run_server(config: AppConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let gateway = build_gateway(&config)?;
    let state = Arc::new(AppState::new(&config, gateway));

    server::serve(state, addr).await
}

async fn process_workbook(
    config: AppConfig,
    input: PathBuf,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let gateway = build_gateway(&config)?;
    let cache = Arc::new(LookupCache::new(&config.cache));
    let pipeline = EnrichmentPipeline::new(gateway, cache, Arc::new(LogProgress), &config);

    let task_id = Uuid::new_v4().to_string();
    let report = pipeline
        .run(&task_id, &input, None)
        .await
        .ok_or_else(|| format!("Task {task_id} failed, see log for details"))?;

    match output {
        Some(output) => {
            tokio::fs::copy(&report, &output).await?;
            println!("{}", output.display());
        }
        None => println!("{}", report.display()),
    }
    Ok(())
}

fn handle_config_command(
    config: &AppConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
