use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use scheduler_harness::config::NodeOptions;
use scheduler_harness::health;
use scheduler_harness::logging;
use scheduler_harness::metrics;
use scheduler_harness::node::SchedulerNode;
use scheduler_harness::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "scheduler-harness")]
#[command(version)]
#[command(about = "Run and inspect scheduler nodes the way integration tests do")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a single scheduler node and keep it running until interrupted
    Node(NodeArgs),

    /// Scrape a metrics endpoint and print the flattened values
    Metrics(MetricsArgs),
}

// =============================================================================
// Node Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Scheduler binary (defaults to $SCHEDULER_BINARY, then `scheduler` on PATH)
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Node ID (random when omitted)
    #[arg(long)]
    id: Option<String>,

    #[arg(long, default_value = "default")]
    namespace: String,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "1")]
    replica_count: u32,

    /// Cluster peers, format: "id=http://host:port,..."
    #[arg(long)]
    initial_cluster: Option<String>,

    /// Storage client ports, format: "id=port,..."
    #[arg(long, value_delimiter = ',')]
    etcd_client_ports: Option<Vec<String>>,

    /// Data directory (a temporary directory is used when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Extra environment for the process, format: KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env_pair)]
    envs: Vec<(String, String)>,

    /// Show the scheduler's own stdout/stderr
    #[arg(long)]
    inherit_output: bool,

    /// Seconds to wait for /healthz
    #[arg(long, default_value = "15")]
    readiness_timeout: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Metrics Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MetricsArgs {
    /// Metrics endpoint, format: host:port
    #[arg(long, short = 'a')]
    addr: String,

    /// Only print keys starting with this prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeOutput {
    id: String,
    namespace: String,
    address: String,
    healthz_url: String,
    metrics_address: String,
    etcd_client_address: Option<String>,
    initial_cluster: String,
    data_dir: String,
}

#[derive(Serialize)]
struct MetricOutput {
    key: String,
    value: f64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

fn node_options(args: &NodeArgs) -> NodeOptions {
    let mut options = NodeOptions::new()
        .with_namespace(args.namespace.as_str())
        .with_log_level(args.log_level.as_str())
        .with_replica_count(args.replica_count)
        .with_readiness_timeout(Duration::from_secs(args.readiness_timeout));

    if let Some(id) = &args.id {
        options = options.with_id(id.as_str());
    }
    if let Some(binary) = &args.binary {
        options = options.with_binary(binary);
    }
    if let Some(initial_cluster) = &args.initial_cluster {
        options = options.with_initial_cluster(initial_cluster.as_str());
    }
    if let Some(entries) = &args.etcd_client_ports {
        options = options.with_etcd_client_ports(entries.iter().map(String::as_str));
    }
    if let Some(dir) = &args.data_dir {
        options = options.with_data_dir(dir);
    }
    for (key, value) in &args.envs {
        options = options.with_env(key.as_str(), value.as_str());
    }
    if args.inherit_output {
        options = options.with_inherited_output();
    }

    options
}

fn print_node(node: &SchedulerNode, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = NodeOutput {
        id: node.id().to_string(),
        namespace: node.namespace().to_string(),
        address: node.address(),
        healthz_url: node.healthz_url(),
        metrics_address: node.metrics_address(),
        etcd_client_address: node.etcd_client_address(),
        initial_cluster: node.initial_cluster().to_string(),
        data_dir: node.data_dir().display().to_string(),
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Scheduler Node");
            println!("{}", "=".repeat(40));
            println!("{:<17} {}", "ID:", output.id);
            println!("{:<17} {}", "Namespace:", output.namespace);
            println!("{:<17} {}", "gRPC:", output.address);
            println!("{:<17} {}", "Health:", output.healthz_url);
            println!("{:<17} {}", "Metrics:", output.metrics_address);
            println!(
                "{:<17} {}",
                "Storage client:",
                output.etcd_client_address.as_deref().unwrap_or("-")
            );
            println!("{:<17} {}", "Initial cluster:", output.initial_cluster);
            println!("{:<17} {}", "Data dir:", output.data_dir);
        }
    }
    Ok(())
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let node = SchedulerNode::new(node_options(&args))?;

    node.run().await?;
    if let Err(e) = node.wait_until_running().await {
        node.cleanup().await?;
        return Err(e.into());
    }

    print_node(&node, &args.output)?;
    tracing::info!(node_id = %node.id(), "Scheduler node ready, press Ctrl-C to stop");

    shutdown.cancelled().await;
    node.cleanup().await?;
    Ok(())
}

async fn run_metrics(args: MetricsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = health::http_client()?;
    let snapshot = metrics::scrape(&client, &args.addr).await?;

    let mut rows: Vec<MetricOutput> = snapshot
        .iter()
        .filter(|(key, _)| args.prefix.as_deref().map_or(true, |p| key.starts_with(p)))
        .map(|(key, value)| MetricOutput {
            key: key.to_string(),
            value,
        })
        .collect();
    rows.sort_by(|a, b| a.key.cmp(&b.key));

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No metrics found.");
            } else {
                let width = rows.iter().map(|r| r.key.len()).max().unwrap_or(0);
                for row in &rows {
                    println!("{:<width$}  {}", row.key, row.value, width = width);
                }
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
    logging::init("info");

    match args.command {
        Commands::Node(node_args) => run_node(node_args).await?,
        Commands::Metrics(metrics_args) => run_metrics(metrics_args).await?,
    }

    Ok(())
}
