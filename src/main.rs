//! wakevirt - Wake-on-LAN operator for KubeVirt clusters

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wakevirt::agent::{self, AgentConfig};
use wakevirt::aggregator::Aggregator;
use wakevirt::controller::{self, Context, FleetParams};
use wakevirt::crd::WolConfig;
use wakevirt::mapper::MacMapper;
use wakevirt::metrics::WolMetrics;
use wakevirt::probes::OperatorProbes;
use wakevirt::starter::KubeVirtStarter;

/// wakevirt - wakes KubeVirt VirtualMachines on Wake-on-LAN packets
#[derive(Parser, Debug)]
#[command(name = "wakevirt", version, about, long_about = None)]
struct Cli {
    /// Generate the WolConfig CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator: gRPC aggregator + WolConfig controller (default)
    Operator(OperatorArgs),

    /// Run the per-node capture agent
    Agent(AgentArgs),
}

/// Operator mode arguments
#[derive(Parser, Debug)]
struct OperatorArgs {
    /// gRPC server listen address for agent event reporting
    #[arg(long, default_value = "0.0.0.0:9090")]
    grpc_addr: SocketAddr,

    /// Agent container image deployed into fleets (drift detection compares
    /// against this)
    #[arg(long, env = "AGENT_IMAGE", default_value = "")]
    agent_image: String,

    /// Namespace the operator (and the agent fleets) run in
    #[arg(long, env = "POD_NAMESPACE", default_value = "wakevirt-system")]
    namespace: String,

    /// gRPC address advertised to agents via fleet pod args
    #[arg(long, default_value = "wakevirt-grpc.wakevirt-system.svc:9090")]
    operator_address: String,

    /// Health probe and metrics HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8081")]
    probe_addr: SocketAddr,
}

/// Agent mode arguments
#[derive(Parser, Debug)]
struct AgentArgs {
    /// Kubernetes node name (from the downward API or environment)
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Operator gRPC address
    #[arg(long, default_value = "wakevirt-grpc.wakevirt-system.svc:9090")]
    operator_address: String,

    /// UDP ports to capture Wake-on-LAN packets on (comma-separated)
    #[arg(long, default_value = "9")]
    ports: String,

    /// Disable the raw Ethernet (EtherType 0x0842) capture path
    #[arg(long)]
    disable_raw: bool,

    /// Health/metrics HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&WolConfig::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Agent(args)) => run_agent(args).await,
        Some(Commands::Operator(args)) => run_operator(args).await,
        None => {
            run_operator(OperatorArgs {
                grpc_addr: "0.0.0.0:9090".parse().unwrap(),
                agent_image: std::env::var("AGENT_IMAGE").unwrap_or_default(),
                namespace: std::env::var("POD_NAMESPACE")
                    .unwrap_or_else(|_| "wakevirt-system".to_string()),
                operator_address: "wakevirt-grpc.wakevirt-system.svc:9090".to_string(),
                probe_addr: "0.0.0.0:8081".parse().unwrap(),
            })
            .await
        }
    }
}

/// Run in agent mode - captures WoL packets on this node
async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    if args.node_name.trim().is_empty() {
        anyhow::bail!("node-name is required (use --node-name or the NODE_NAME env var)");
    }
    let ports = agent::parse_ports(&args.ports)
        .map_err(|e| anyhow::anyhow!("failed to parse --ports {:?}: {}", args.ports, e))?;

    let config = AgentConfig {
        node_name: args.node_name,
        operator_address: args.operator_address,
        ports,
        enable_raw: !args.disable_raw,
        health_addr: args.health_addr,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    agent::run(config, shutdown).await?;
    tracing::info!("agent stopped gracefully");
    Ok(())
}

/// Run in operator mode - aggregates events and reconciles WolConfigs
async fn run_operator(args: OperatorArgs) -> anyhow::Result<()> {
    tracing::info!("wakevirt operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    let metrics = Arc::new(WolMetrics::new()?);
    let mapper = Arc::new(MacMapper::new());
    let starter = Arc::new(KubeVirtStarter::new(client.clone()));

    let fleet_params = FleetParams {
        agent_image: args.agent_image,
        operator_address: args.operator_address,
        namespace: args.namespace,
    };
    let ctx = Arc::new(Context::new(
        client.clone(),
        mapper.clone(),
        metrics.clone(),
        fleet_params.clone(),
    ));

    // gRPC aggregator and its dedupe sweep; both stop on the token, which
    // fires when the controller observes the termination signal.
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let probes = OperatorProbes::new(metrics.registry.clone());
    tokio::spawn({
        let probes = probes.clone();
        let shutdown = shutdown.clone();
        let addr = args.probe_addr;
        async move {
            if let Err(e) = wakevirt::probes::serve(addr, probes, shutdown).await {
                tracing::error!(error = %e, "probe server error");
            }
        }
    });

    let aggregator = Aggregator::new(mapper, starter, metrics);
    probes
        .grpc_serving
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let grpc_server = tokio::spawn({
        let aggregator = aggregator.clone();
        let shutdown = shutdown.clone();
        let addr = args.grpc_addr;
        async move {
            if let Err(e) = aggregator.serve(addr, shutdown).await {
                tracing::error!(error = %e, "gRPC server error");
            }
        }
    });
    tokio::spawn(aggregator.run_sweeper(shutdown.clone()));

    // One-shot image drift detection; never blocks startup.
    controller::spawn_startup_drift_detection(
        ctx.configs.clone(),
        ctx.fleets.clone(),
        fleet_params,
    );

    // The controller runs until the termination signal.
    controller::run(client, ctx).await?;

    shutdown.cancel();
    let _ = grpc_server.await;

    tracing::info!("wakevirt operator shutting down");
    Ok(())
}

/// Propagates SIGINT/SIGTERM into the cancellation token.
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("termination signal received");
    token.cancel();
}
