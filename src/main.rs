//! Emberchain node - main entry point.
//!
//! Parses CLI flags (layered over an optional config file), brings up the
//! blockchain, block store, P2P service and JSON-RPC server, and optionally
//! starts a background CPU miner.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use emberchain_consensus::{Blockchain, ConsensusParams};
use emberchain_crypto::Address;
use emberchain_mempool::Mempool;
use emberchain_mining::cpu::CpuMiner;
use emberchain_network::sync::GenesisConfig;
use emberchain_network::{NetworkConfig, NetworkService};
use emberchain_rpc::{KeyStore, RpcConfig, RpcContext, RpcServer};
use emberchain_storage::{create_block_store, StorageConfig};

#[derive(Parser, Debug)]
#[clap(name = "emberchain")]
#[clap(about = "Emberchain - a minimal UTXO proof-of-work cryptocurrency node")]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network to connect to (mainnet, testnet, regtest)
    #[clap(long, default_value = "mainnet")]
    network: String,

    /// Enable mining
    #[clap(long)]
    mine: bool,

    /// Mining address to receive block rewards. If mining is enabled and no
    /// address is given, a fresh one is generated and logged.
    #[clap(long)]
    mining_address: Option<String>,

    /// Number of mining threads (CPU mining only)
    #[clap(long, default_value = "1")]
    threads: usize,

    /// Enable the JSON-RPC server
    #[clap(long, default_value = "true")]
    rpc: bool,

    /// JSON-RPC bind address
    #[clap(long, default_value = "127.0.0.1:8332")]
    rpc_bind: String,

    /// P2P listen address
    #[clap(long)]
    listen: Option<String>,

    /// Additional peer to dial at startup, may be repeated
    #[clap(long = "connect")]
    seed_peers: Vec<String>,

    /// Data directory
    #[clap(long, value_name = "DIR")]
    datadir: Option<PathBuf>,

    /// Verbosity level (0-4)
    #[clap(short, long, default_value = "3")]
    verbosity: u8,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new data directory with the network's genesis block
    Init {
        /// Re-initialize even if the data directory already holds a chain
        #[clap(long)]
        force: bool,
    },
    /// Import blocks from a JSON file, validating each one in order
    Import {
        #[clap(value_name = "FILE")]
        file: PathBuf,
    },
    /// Export a range of blocks to a JSON file
    Export {
        #[clap(value_name = "FILE")]
        file: PathBuf,
        #[clap(long, default_value = "0")]
        start: u64,
        #[clap(long)]
        end: Option<u64>,
    },
}

/// Node configuration, as it would be loaded from a config file. CLI flags
/// layer on top of whatever this carries, which itself layers on top of the
/// hardcoded defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeConfig {
    network: String,
    datadir: String,
    listen_addr: String,
    seed_peers: Vec<String>,
    rpc_enabled: bool,
    rpc_bind: String,
    mine: bool,
    mining_address: Option<String>,
    mining_threads: usize,
}

fn load_node_config(cli: &Cli) -> Result<NodeConfig, config::ConfigError> {
    let mut builder = config::Config::builder()
        .set_default("network", "mainnet")?
        .set_default("datadir", ".emberchain")?
        .set_default("listen_addr", "0.0.0.0:8333")?
        .set_default("seed_peers", Vec::<String>::new())?
        .set_default("rpc_enabled", true)?
        .set_default("rpc_bind", "127.0.0.1:8332")?
        .set_default("mine", false)?
        .set_default("mining_address", None::<String>)?
        .set_default("mining_threads", 1)?;

    if let Some(path) = &cli.config {
        builder = builder.add_source(config::File::from(path.as_path()).required(false));
    }

    let mut node_config: NodeConfig = builder.build()?.try_deserialize()?;

    node_config.network = cli.network.clone();
    node_config.rpc_enabled = cli.rpc;
    if cli.mine {
        node_config.mine = true;
    }
    if let Some(addr) = &cli.mining_address {
        node_config.mining_address = Some(addr.clone());
    }
    if cli.threads != 1 {
        node_config.mining_threads = cli.threads;
    }
    if cli.rpc_bind != "127.0.0.1:8332" {
        node_config.rpc_bind = cli.rpc_bind.clone();
    }
    if let Some(listen) = &cli.listen {
        node_config.listen_addr = listen.clone();
    }
    if !cli.seed_peers.is_empty() {
        node_config.seed_peers = cli.seed_peers.clone();
    }
    if let Some(dir) = &cli.datadir {
        node_config.datadir = dir.to_string_lossy().to_string();
    }

    Ok(node_config)
}

fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new().filter_level(log_level).format_timestamp_millis().init();
}

fn parse_address(s: &str) -> Result<Address, String> {
    Address::from_base58check(s).map_err(|e| e.to_string())
}

fn consensus_params_for(network: &str) -> ConsensusParams {
    match network {
        "testnet" => ConsensusParams::testnet(),
        "regtest" => ConsensusParams::regtest(),
        "mainnet" => ConsensusParams::mainnet(),
        other => {
            warn!("unknown network {other:?}, defaulting to mainnet");
            ConsensusParams::mainnet()
        }
    }
}

fn genesis_for(network: &str) -> emberchain_core::Block {
    match network {
        "testnet" => GenesisConfig::testnet().create_genesis_block(),
        "regtest" => GenesisConfig::regtest().create_genesis_block(),
        _ => GenesisConfig::mainnet().create_genesis_block(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    let node_config = match load_node_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration: {e}");
            process::exit(1);
        }
    };

    if let Some(command) = &cli.command {
        run_subcommand(command, &node_config).await;
        return;
    }

    info!("starting emberchain node on {}", node_config.network);

    let params = consensus_params_for(&node_config.network);
    let genesis = genesis_for(&node_config.network);

    let storage_config = StorageConfig { data_dir: node_config.datadir.clone(), persist: node_config.network != "regtest" };
    let block_store = match create_block_store(&storage_config).await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open block store at {}: {e}", storage_config.data_dir);
            process::exit(1);
        }
    };

    if block_store.get_best_block_height().await.is_err() {
        if let Err(e) = block_store.store_block(&genesis).await {
            error!("failed to persist genesis block: {e}");
            process::exit(1);
        }
        if let Err(e) = block_store.set_best_block(&genesis.hash()).await {
            error!("failed to record genesis as best block: {e}");
            process::exit(1);
        }
    }

    let blockchain = match Blockchain::new(params, genesis) {
        Ok(chain) => Arc::new(chain),
        Err(e) => {
            error!("failed to initialize blockchain: {e}");
            process::exit(1);
        }
    };
    let mempool = Arc::new(Mempool::new());

    let listen_addr: SocketAddr = match node_config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid listen address {:?}: {e}", node_config.listen_addr);
            process::exit(1);
        }
    };
    let mut seed_peers = Vec::new();
    for addr in &node_config.seed_peers {
        match addr.parse() {
            Ok(addr) => seed_peers.push(addr),
            Err(e) => warn!("ignoring invalid seed peer {addr:?}: {e}"),
        }
    }
    let network_config = NetworkConfig {
        network: blockchain.params().network,
        listen_addr,
        seed_peers,
        user_agent: format!("/emberchain:{}/", env!("CARGO_PKG_VERSION")),
    };
    let network = NetworkService::new(network_config, blockchain.clone(), mempool.clone(), block_store.clone());
    {
        let network = network.clone();
        tokio::spawn(async move {
            if let Err(e) = network.start().await {
                error!("network service stopped: {e}");
            }
        });
    }

    let default_reward_address = match &node_config.mining_address {
        Some(s) => match parse_address(s) {
            Ok(addr) => Some(addr),
            Err(e) => {
                error!("invalid mining address {s:?}: {e}");
                process::exit(1);
            }
        },
        None => None,
    };

    let mut miner: Option<CpuMiner> = None;
    if node_config.mine {
        let reward_address = match default_reward_address {
            Some(addr) => addr,
            None => {
                let (_, _, addr) = emberchain_crypto::generate_keypair();
                info!("no mining address configured, generated {} for this run", addr.to_base58check());
                addr
            }
        };

        let handle = tokio::runtime::Handle::current();
        let block_store_for_miner = block_store.clone();
        let network_for_miner = network.clone();
        let mempool_for_miner = mempool.clone();
        miner = Some(CpuMiner::start(
            blockchain.clone(),
            mempool.clone(),
            reward_address,
            node_config.mining_threads.max(1),
            move |block| {
                let block_store = block_store_for_miner.clone();
                let network = network_for_miner.clone();
                mempool_for_miner.remove_confirmed(&block);
                handle.block_on(async {
                    if let Err(e) = block_store.store_block(&block).await {
                        error!("mining: failed to persist block: {e}");
                        return;
                    }
                    if let Err(e) = block_store.set_best_block(&block.hash()).await {
                        error!("mining: failed to update best block: {e}");
                    }
                    network.broadcast_block(&block).await;
                });
            },
        ));
    }

    if node_config.rpc_enabled {
        let bind_addr: SocketAddr = match node_config.rpc_bind.parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("invalid RPC bind address {:?}: {e}", node_config.rpc_bind);
                process::exit(1);
            }
        };
        let context = RpcContext {
            blockchain: blockchain.clone(),
            mempool: mempool.clone(),
            network: network.clone(),
            block_store: block_store.clone(),
            keystore: Arc::new(KeyStore::new()),
            default_reward_address,
            mining_threads: node_config.mining_threads.max(1),
        };
        let rpc_server = RpcServer::new(RpcConfig { bind_addr, cors_domains: vec![] }, context);
        if let Err(e) = rpc_server.start().await {
            error!("RPC server stopped: {e}");
        }
    } else {
        // Without RPC there's nothing else to block on; park the main task
        // until the process receives a termination signal.
        let _ = tokio::signal::ctrl_c().await;
    }

    drop(miner);
}

async fn run_subcommand(command: &Commands, node_config: &NodeConfig) {
    let storage_config = StorageConfig { data_dir: node_config.datadir.clone(), persist: true };

    match command {
        Commands::Init { force } => {
            let block_store = match create_block_store(&storage_config).await {
                Ok(store) => store,
                Err(e) => {
                    error!("failed to open data directory {}: {e}", storage_config.data_dir);
                    process::exit(1);
                }
            };
            let already_initialized = block_store.get_best_block_height().await.is_ok();
            if already_initialized && !force {
                error!("data directory {} already holds a chain; pass --force to re-initialize", storage_config.data_dir);
                process::exit(1);
            }
            let genesis = genesis_for(&node_config.network);
            if let Err(e) = block_store.store_block(&genesis).await {
                error!("failed to store genesis block: {e}");
                process::exit(1);
            }
            if let Err(e) = block_store.set_best_block(&genesis.hash()).await {
                error!("failed to record genesis as best block: {e}");
                process::exit(1);
            }
            info!(
                "initialized {} chain in {} with genesis {}",
                node_config.network,
                storage_config.data_dir,
                emberchain_core::hash_to_hex(&genesis.hash())
            );
        }
        Commands::Import { file } => {
            let data = match std::fs::read_to_string(file) {
                Ok(data) => data,
                Err(e) => {
                    error!("failed to read {}: {e}", file.display());
                    process::exit(1);
                }
            };
            let blocks: Vec<emberchain_core::Block> = match serde_json::from_str(&data) {
                Ok(blocks) => blocks,
                Err(e) => {
                    error!("failed to parse {}: {e}", file.display());
                    process::exit(1);
                }
            };
            let Some(first) = blocks.first() else {
                warn!("{} contains no blocks", file.display());
                return;
            };

            let params = consensus_params_for(&node_config.network);
            let blockchain = match Blockchain::new(params, first.clone()) {
                Ok(chain) => chain,
                Err(e) => {
                    error!("imported genesis block rejected: {e}");
                    process::exit(1);
                }
            };
            let block_store = match create_block_store(&storage_config).await {
                Ok(store) => store,
                Err(e) => {
                    error!("failed to open data directory {}: {e}", storage_config.data_dir);
                    process::exit(1);
                }
            };
            if let Err(e) = block_store.store_block(first).await {
                error!("failed to persist block 0: {e}");
                process::exit(1);
            }
            if let Err(e) = block_store.set_best_block(&first.hash()).await {
                error!("failed to record best block: {e}");
                process::exit(1);
            }

            let mut imported = 1u64;
            for block in &blocks[1..] {
                if let Err(e) = blockchain.accept_block(block.clone()) {
                    error!("block at height {} rejected: {e}", block.height);
                    process::exit(1);
                }
                if let Err(e) = block_store.store_block(block).await {
                    error!("failed to persist block {}: {e}", block.height);
                    process::exit(1);
                }
                if let Err(e) = block_store.set_best_block(&block.hash()).await {
                    error!("failed to record best block: {e}");
                    process::exit(1);
                }
                imported += 1;
            }
            info!("imported {imported} blocks, chain height now {}", blockchain.height());
        }
        Commands::Export { file, start, end } => {
            let block_store = match create_block_store(&storage_config).await {
                Ok(store) => store,
                Err(e) => {
                    error!("failed to open data directory {}: {e}", storage_config.data_dir);
                    process::exit(1);
                }
            };
            let end_height = match end {
                Some(end) => *end,
                None => match block_store.get_best_block_height().await {
                    Ok(height) => height,
                    Err(e) => {
                        error!("failed to determine chain height: {e}");
                        process::exit(1);
                    }
                },
            };
            let blocks = match block_store.get_blocks_by_height_range(*start, end_height).await {
                Ok(blocks) => blocks,
                Err(e) => {
                    error!("failed to read blocks: {e}");
                    process::exit(1);
                }
            };
            let json = match serde_json::to_string_pretty(&blocks) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to serialize blocks: {e}");
                    process::exit(1);
                }
            };
            if let Err(e) = std::fs::write(file, json) {
                error!("failed to write {}: {e}", file.display());
                process::exit(1);
            }
            info!("exported {} blocks ({start}..={end_height}) to {}", blocks.len(), file.display());
        }
    }
}
