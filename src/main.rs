use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use conductor_lite::config::{CoordinationConfig, NodeConfig};
use conductor_lite::coordination::{CoordinationStore, MemoryEnsemble};
use conductor_lite::execution::{MemoryTaskStore, TaskRecord, TaskStore, TransitionOutcome};
use conductor_lite::lock::resolve_node_id;
use conductor_lite::node::Node;
use conductor_lite::shutdown::install_shutdown_handler;
use conductor_lite::transport::{EventBroker, MemoryBroker};

#[derive(Parser, Debug)]
#[command(name = "conductor-lite")]
#[command(version)]
#[command(about = "Per-task execution locks, lifecycle events and live SSE fan-out")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a conductor-lite node
    Server(ServerArgs),

    /// Run several in-process nodes racing to start the same tasks
    Simulate(SimulateArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (defaults to hostname-pid)
    #[arg(long)]
    node_id: Option<String>,

    /// Port for the live stream / status HTTP endpoints (optional)
    #[arg(long)]
    http_port: Option<u16>,

    /// ZooKeeper ensemble address list, e.g. "zk1:2181,zk2:2181".
    /// Without it the node runs on a private in-process store.
    #[arg(long)]
    connect_string: Option<String>,

    /// Seconds the ensemble keeps this node's session alive without contact
    #[arg(long, default_value = "60")]
    session_timeout_secs: u64,

    /// Namespace root for every coordination path
    #[arg(long, default_value = "conductor")]
    namespace: String,

    /// Seconds to wait when connecting to the coordination store
    #[arg(long, default_value = "15")]
    connection_timeout_secs: u64,

    /// Seconds `acquire` waits for a task lock
    #[arg(long, default_value = "30")]
    acquire_timeout_secs: u64,

    /// Source name stamped on published events
    #[arg(long, default_value = "conductor-api")]
    event_source: String,

    /// Consumer group prefix; the node id is appended
    #[arg(long, default_value = "conductor-broadcast")]
    group_prefix: String,

    /// Partitions per topic for the in-process broker
    #[arg(long, default_value = "3")]
    partitions: usize,

    /// Kafka bootstrap servers; uses the in-process broker when absent
    #[cfg(feature = "kafka")]
    #[arg(long)]
    kafka_brokers: Option<String>,
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of in-process nodes
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of tasks every node tries to start
    #[arg(long, default_value = "5")]
    tasks: usize,

    /// Lock acquire timeout in milliseconds
    #[arg(long, default_value = "200")]
    acquire_timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', value_enum, default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SimulationRow {
    task_id: String,
    node_id: String,
    outcome: String,
}

// =============================================================================
// Server
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_broker(args: &ServerArgs) -> Result<Arc<dyn EventBroker>, Box<dyn std::error::Error>> {
    #[cfg(feature = "kafka")]
    {
        if let Some(brokers) = &args.kafka_brokers {
            let config = conductor_lite::transport::KafkaBrokerConfig {
                brokers: brokers.clone(),
                client_id: args.event_source.clone(),
                ..Default::default()
            };
            return Ok(Arc::new(conductor_lite::transport::KafkaBroker::new(config)?));
        }
    }

    tracing::info!(partitions = args.partitions, "Using in-process event broker");
    Ok(Arc::new(MemoryBroker::new(args.partitions)))
}

async fn build_coordination(
    args: &ServerArgs,
    config: &CoordinationConfig,
) -> Result<Arc<dyn CoordinationStore>, Box<dyn std::error::Error>> {
    if args.connect_string.is_some() {
        #[cfg(feature = "zookeeper")]
        {
            let session = conductor_lite::coordination::ZooKeeperSession::connect(config).await?;
            return Ok(Arc::new(session));
        }
        #[cfg(not(feature = "zookeeper"))]
        {
            return Err(format!(
                "--connect-string {} requires a build with the `zookeeper` feature",
                config.connect_string
            )
            .into());
        }
    }

    tracing::warn!(
        "No --connect-string given, using a private in-process coordination store; \
         locks are not shared with other processes"
    );
    Ok(Arc::new(MemoryEnsemble::new().connect()))
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let node_id = args.node_id.clone().unwrap_or_else(resolve_node_id);
    let http_addr: Option<SocketAddr> = match args.http_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = NodeConfig::new(node_id)
        .with_acquire_timeout(Duration::from_secs(args.acquire_timeout_secs));
    config.http_addr = http_addr;
    if let Some(connect_string) = &args.connect_string {
        config.coordination.connect_string = connect_string.clone();
    }
    config.coordination.session_timeout_ms = args.session_timeout_secs * 1000;
    config.coordination.namespace = args.namespace.clone();
    config.coordination.connection_timeout_ms = args.connection_timeout_secs * 1000;
    config.events.source = args.event_source.clone();
    config.events.group_prefix = args.group_prefix.clone();

    let coordination = build_coordination(&args, &config.coordination).await?;
    let broker = build_broker(&args)?;
    let tasks: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());

    tracing::info!(
        node_id = %config.node_id,
        http_addr = ?config.http_addr,
        namespace = %config.coordination.namespace,
        consumer_group = %config.consumer_group(),
        "Starting conductor-lite node"
    );

    let node = Node::start(config, coordination, broker, tasks).await?;
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Simulation
// =============================================================================

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let ensemble = MemoryEnsemble::new();
    let broker = MemoryBroker::default();
    let store = Arc::new(MemoryTaskStore::new());
    let shutdown = tokio_util::sync::CancellationToken::new();

    let mut coordinators = Vec::new();
    let mut runners = Vec::new();
    for i in 1..=args.nodes.max(1) {
        let config = NodeConfig::new(format!("node-{i}"))
            .with_acquire_timeout(Duration::from_millis(args.acquire_timeout_ms));
        let node = Node::start(
            config,
            Arc::new(ensemble.connect()),
            Arc::new(broker.clone()),
            store.clone(),
        )
        .await?;
        coordinators.push((node.config.node_id.clone(), node.coordinator.clone()));
        runners.push(tokio::spawn(node.run(shutdown.clone())));
    }

    let mut rows = Vec::new();
    for t in 1..=args.tasks {
        let task_id = format!("task-{t}");
        store.insert(TaskRecord::new(task_id.clone(), "sim-session")).await?;

        let attempts = coordinators.iter().map(|(node_id, coordinator)| {
            let task_id = task_id.clone();
            let node_id = node_id.clone();
            let coordinator = coordinator.clone();
            async move {
                let outcome = match coordinator.start_task(&task_id).await {
                    Ok(TransitionOutcome::Applied(task)) => format!("started ({})", task.status),
                    Ok(TransitionOutcome::LockNotAcquired) => "lock not acquired".to_string(),
                    Ok(TransitionOutcome::Rejected { current }) => format!("rejected ({current})"),
                    Err(e) => format!("error: {e}"),
                };
                SimulationRow {
                    task_id,
                    node_id,
                    outcome,
                }
            }
        });
        rows.extend(futures::future::join_all(attempts).await);
    }

    shutdown.cancel();
    for runner in runners {
        runner.await??;
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table => {
            println!("{:<12} {:<10} OUTCOME", "TASK", "NODE");
            println!("{}", "-".repeat(48));
            for row in &rows {
                println!("{:<12} {:<10} {}", row.task_id, row.node_id, row.outcome);
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

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Simulate(simulate_args) => {
            run_simulation(simulate_args).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_without_connect_string_runs_on_a_private_store() {
        let args = ServerArgs::parse_from(["server"]);
        let store = build_coordination(&args, &CoordinationConfig::default())
            .await
            .unwrap();
        assert_eq!(store.state().to_string(), "connected");
    }

    #[cfg(not(feature = "zookeeper"))]
    #[tokio::test]
    async fn connect_string_is_never_silently_ignored() {
        let args = ServerArgs::parse_from(["server", "--connect-string", "zk1:2181,zk2:2181"]);
        let config = CoordinationConfig {
            connect_string: "zk1:2181,zk2:2181".to_string(),
            ..Default::default()
        };
        let err = build_coordination(&args, &config).await.err().unwrap();
        assert!(err.to_string().contains("zookeeper"));
    }

    #[test]
    fn session_timeout_flag_is_parsed() {
        let args = ServerArgs::parse_from(["server", "--session-timeout-secs", "20"]);
        assert_eq!(args.session_timeout_secs, 20);
        assert!(args.connect_string.is_none());
    }
}
