//! ChainDB Server - chain-replicated in-memory table store
//!
//! `serve` runs one table server and joins it to a chain; `coordinator`
//! runs the coordination service the chain members register with.

use anyhow::{Context, Result};
use chaindb_core::config::{LogFormat, LoggingSettings};
use chaindb_core::coord::CoordServer;
use chaindb_core::logging::init_logging;
use chaindb_core::{
    connect_coordinator, ChainMembership, ConfigManager, Database, Dispatcher,
    DistributedDatabase, MemoryCoordinator, TableServer,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chaindb-server")]
#[command(about = "ChainDB - chain-replicated in-memory table store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a table server and join the chain
    Serve(ServeArgs),
    /// Run the coordination service
    Coordinator(CoordinatorArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, env = "CHAINDB_CONFIG", default_value = "chaindb.toml")]
    config: PathBuf,

    /// TCP server port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Number of hash buckets
    #[arg(short = 'n', long)]
    n_lists: Option<usize>,

    /// Coordination service address, or "memory"
    #[arg(long, env = "CHAINDB_COORDINATOR")]
    coordinator: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[derive(Args, Debug)]
struct CoordinatorArgs {
    /// Listen address
    #[arg(short = 'l', long, default_value = "127.0.0.1:2181")]
    listen: String,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Coordinator(args) => run_coordinator(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ConfigManager::load(args.config.clone())?.into_config();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(n_lists) = args.n_lists {
        config.server.n_lists = n_lists;
    }
    if let Some(coordinator) = args.coordinator {
        config.coordination.connect = coordinator;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    ConfigManager::validate_config(&config)?;

    init_logging(&config.logging)?;

    info!("ChainDB server starting");
    info!("  config:        {}", args.config.display());
    info!("  listen:        {}", config.server.bind_address());
    info!("  buckets:       {}", config.server.n_lists);
    info!("  coordinator:   {}", config.coordination.connect);
    info!("  chain path:    {}", config.coordination.chain_path);

    let db = Database::new(config.server.n_lists)?
        .with_slow_op_threshold(config.logging.slow_op_threshold());
    let ddb = Arc::new(DistributedDatabase::new(db));

    let server = TableServer::bind(
        config.server.bind_address(),
        Dispatcher::new(Arc::clone(&ddb)),
    )
    .await
    .with_context(|| format!("Failed to bind {}", config.server.bind_address()))?
    .with_max_connections(config.server.max_connections)
    .with_max_frame_bytes(config.network.max_frame_bytes);
    let port = server.local_addr()?.port();
    let advertise_addr = format!("{}:{}", config.server.advertise_host, port);

    let coordinator = connect_coordinator(&config.coordination)
        .await
        .context("Failed to connect to the coordination service")?;
    let membership = Arc::new(ChainMembership::new(
        coordinator,
        Arc::clone(&ddb),
        config.coordination.chain_path.clone(),
        advertise_addr.clone(),
        config.network,
    ));
    let watch = membership.join().await.context("Failed to join the chain")?;
    info!("Serving as {} at {}", membership.own_path().unwrap_or_default(), advertise_addr);

    let mut watcher = {
        let membership = Arc::clone(&membership);
        tokio::spawn(async move { membership.run(watch).await })
    };

    let outcome = tokio::select! {
        _ = server.serve_until(shutdown_signal()) => Ok(()),
        finished = &mut watcher => match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::from(e).context("Chain membership ended")),
            Err(e) => Err(anyhow::anyhow!("Membership task failed: {}", e)),
        },
    };

    if let Err(e) = membership.leave().await {
        warn!("Failed to leave the chain cleanly: {}", e);
    }
    watcher.abort();

    match &outcome {
        Ok(()) => info!("ChainDB server stopped"),
        Err(e) => error!("ChainDB server stopped: {:#}", e),
    }
    outcome
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<()> {
    let logging = LoggingSettings {
        level: if args.debug { "debug" } else { "info" }.to_string(),
        format: if args.json { LogFormat::Json } else { LogFormat::Text },
        ..LoggingSettings::default()
    };
    init_logging(&logging)?;

    let server = CoordServer::bind(args.listen.as_str(), MemoryCoordinator::new())
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("Coordination service listening on {}", server.local_addr()?);

    server.serve_until(shutdown_signal()).await;
    info!("Coordination service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
