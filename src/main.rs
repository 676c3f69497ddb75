use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crontab_lite::config::NodeConfig;
use crontab_lite::node::Node;
use crontab_lite::scheduler::Job;
use crontab_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "crontab-lite")]
#[command(version)]
#[command(about = "A distributed cron scheduler with lease-based job locking")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node: admin API and workers over a coordination store
    Server(ServerArgs),

    /// Print the next fire times of a cron expression
    NextFires {
        /// Cron expression with a seconds field, e.g. "*/5 * * * * *"
        expr: String,

        /// Number of fire times to print
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// JSON config file; flags below override its values
    #[arg(long, short = 'c', env = "CRONTAB_CONFIG")]
    config: Option<PathBuf>,

    /// etcd endpoints shared with other nodes; an embedded store is used
    /// when none are given
    #[arg(long = "etcd", env = "CRONTAB_ETCD_ENDPOINTS", value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Port for the admin API
    #[arg(long)]
    api_port: Option<u16>,

    /// Directory of static files served by the admin API
    #[arg(long, conflicts_with = "no_api")]
    webroot: Option<PathBuf>,

    /// Run without the admin API
    #[arg(long, conflicts_with = "api_port")]
    no_api: bool,

    /// Number of workers in this process; 0 runs the master only
    #[arg(long)]
    workers: Option<usize>,

    /// Worker id (suffixed with -N when running several workers)
    #[arg(long, env = "CRONTAB_WORKER_ID")]
    worker_id: Option<String>,

    /// SQLite file for execution logs; logs stay in memory when unset
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Shell used to run job commands
    #[arg(long)]
    shell: Option<String>,

    /// Maximum random delay before taking a job lock, in milliseconds
    #[arg(long)]
    lock_jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct NextFiresOutput {
    expr: String,
    fires: Vec<String>,
}

fn build_config(args: ServerArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    if !args.etcd_endpoints.is_empty() {
        config.store.endpoints = args.etcd_endpoints;
    }
    if let Some(port) = args.api_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_api(addr);
    }
    if let Some(webroot) = args.webroot {
        let api = config.api.get_or_insert_with(Default::default);
        api.webroot = Some(webroot);
    }
    if args.no_api {
        config = config.without_api();
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker = config.worker.with_worker_id(worker_id);
    }
    if let Some(path) = args.sqlite {
        config.log_store.sqlite_path = Some(path);
    }
    if let Some(shell) = args.shell {
        config.worker.shell = shell;
    }
    if let Some(jitter) = args.lock_jitter_ms {
        config.worker.lock_jitter_max_ms = jitter;
    }
    Ok(config)
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(args)?;

    tracing::info!(
        worker_id = %config.worker.worker_id,
        workers = config.worker_count,
        etcd = ?config.store.endpoints,
        api = ?config.api.as_ref().map(|a| a.listen_addr),
        sqlite = ?config.log_store.sqlite_path,
        "Starting crontab-lite node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config).await?;
    node.run(shutdown).await?;

    Ok(())
}

fn handle_next_fires(
    expr: String,
    count: usize,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let schedule = Job::new("preview", "true", expr.clone()).schedule()?;
    let fires: Vec<String> = schedule
        .upcoming(chrono::Utc)
        .take(count)
        .map(|t| t.to_rfc3339())
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = NextFiresOutput { expr, fires };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if fires.is_empty() {
                println!("No upcoming fire times for \"{}\"", expr);
            }
            for (i, fire) in fires.iter().enumerate() {
                println!("{:>3}  {}", i + 1, fire);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::NextFires {
            expr,
            count,
            output,
        } => {
            handle_next_fires(expr, count, &output)?;
        }
    }

    Ok(())
}
