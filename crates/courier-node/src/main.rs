//! Courier Node -- hello-world active-messaging node.
//!
//! Usage:
//!   courier-node                                  # Server: greet peers once `wait_for` joined
//!   courier-node --connect localhost:9000         # Client: connect, wait for a greeting
//!   courier-node --config path.toml --wait-for 2  # Override config values
//!   courier-node config                           # Print effective config

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use courier_node::config::{NodeConfig, PeerEntry};
use courier_node::{expand_tilde, Node, NodeHandle, Registry, TypedAction};

#[derive(Parser)]
#[command(name = "courier-node", about = "Courier active-messaging node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.courier/config.toml")]
    config: String,

    /// Listen address, overrides `node.listen_addr`
    #[arg(long)]
    listen: Option<String>,

    /// Peers required before the entry action runs, overrides `node.wait_for`
    #[arg(long)]
    wait_for: Option<usize>,

    /// Peer to connect to (host:port); repeatable. Any peer makes this a client.
    #[arg(long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the effective config as TOML
    Config,
}

/// Printed by whoever receives it; the receiver then stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloWorld;

impl TypedAction<NodeHandle> for HelloWorld {
    const TAG: &'static str = "hello_world";

    fn invoke(self, node: &NodeHandle) {
        println!("hello world");
        node.stop();
    }
}

/// Greet every connected peer; stop once all writes completed.
fn hello_world_main(node: &NodeHandle) {
    let conns = node.connections();
    let remaining = Arc::new(AtomicUsize::new(conns.len()));
    tracing::info!(peers = conns.len(), "greeting peers");
    if conns.is_empty() {
        node.stop();
        return;
    }

    for conn in conns {
        let remaining = remaining.clone();
        let node = node.clone();
        let remote = conn.remote();
        conn.write_with(&HelloWorld, move |result| {
            if let Err(e) = result {
                tracing::warn!(%remote, "greeting failed: {e}");
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                node.stop();
            }
        });
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_node=info,courier_protocol=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut cfg = NodeConfig::load_or_default(&config_path)?;

    if let Some(listen) = cli.listen {
        cfg.node.listen_addr = listen;
    }
    if let Some(wait_for) = cli.wait_for {
        cfg.node.wait_for = wait_for;
    }
    cfg.network
        .peers
        .extend(cli.connect.into_iter().map(|addr| PeerEntry { addr }));
    cfg.validate()?;

    match cli.command {
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Some(Commands::Run) | None => {
            run_node(cfg)?;
        }
    }

    Ok(())
}

fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let mut registry = Registry::new();
    registry.register_typed::<HelloWorld>();

    let peers = cfg
        .network
        .peers
        .iter()
        .map(PeerEntry::host_port)
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.node.listen_addr,
        wait_for = cfg.node.wait_for,
        peers = peers.len(),
        "starting courier-node"
    );

    let node = if peers.is_empty() {
        println!("Running as server, will execute hello_world_main");
        Node::with_entry(cfg, registry, hello_world_main)?
    } else {
        println!("Running as client, will not execute hello_world_main");
        let node = Node::new(cfg, registry)?;
        for (host, port) in &peers {
            let conn = node.connect(host, *port)?;
            tracing::info!(remote = %conn.remote(), "connected to peer");
        }
        node
    };

    node.start()?;
    node.run()?;

    let stats = node.stats();
    tracing::info!(
        parcels = stats.parcels_dispatched,
        frames_written = stats.frames_written,
        "courier-node exiting"
    );
    Ok(())
}
