use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use ringkv::admin::{AdminClient, SocketPool};
use ringkv::config::NodeConfig;
use ringkv::error::Result;
use ringkv::server::NodeServer;
use ringkv::store::{FilesystemStore, MetadataStore};
use ringkv::telemetry;

#[derive(Parser)]
#[command(name = "ringkv", about = "Partitioned, replicated key-value store node")]
struct Cli {
    /// Node home directory (holds config.toml, metadata/ and data/).
    #[arg(long, default_value = ".")]
    home: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node server until killed.
    Serve,
    /// Steal partitions from the rest of the cluster onto this node.
    Steal {
        #[arg(long)]
        store: String,
    },
    /// Hand this node's partitions back to the rest of the cluster.
    Return {
        #[arg(long)]
        store: String,
    },
    /// Flip a node's lifecycle state and restart its services.
    State {
        node_id: u16,
        state: StateArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Normal,
    Rebalancing,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("ringkv: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = NodeConfig::load(&cli.home)?;
    telemetry::init(&config.logging);

    match cli.command {
        Command::Serve => {
            let _server = NodeServer::start(&config)?;
            loop {
                std::thread::park();
            }
        }
        Command::Steal { store } => admin_client(&config)?.steal_partitions_from_cluster(&store),
        Command::Return { store } => admin_client(&config)?.return_partitions_to_cluster(&store),
        Command::State { node_id, state } => {
            let client = admin_client(&config)?;
            match state {
                StateArg::Normal => client.set_normal_state_and_restart(node_id),
                StateArg::Rebalancing => client.set_rebalancing_state_and_restart(node_id),
            }
        }
    }
}

/// Builds an admin client from the local metadata directory; the target
/// nodes' addresses come out of the persisted cluster.xml.
fn admin_client(config: &NodeConfig) -> Result<AdminClient> {
    let inner = FilesystemStore::open("metadata", config.metadata_dir())?;
    let metadata = Arc::new(MetadataStore::new(inner));
    let local = metadata.get_cluster()?.node(config.node_id)?.clone();
    let pool = Arc::new(SocketPool::new(config.socket_pool.clone()));
    Ok(AdminClient::new(local, metadata, pool))
}
