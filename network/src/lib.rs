//! P2P networking: peer connections, wire framing, and chain synchronization
//! for Emberchain nodes.
//!
//! `NetworkService` owns the listener and the outbound connection attempts;
//! every decoded message flows through one central dispatch loop so the
//! blockchain-state and mempool locks are only ever taken from that one
//! place, never from a peer's own reader task.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};

use emberchain_consensus::Blockchain;
use emberchain_core::{Block, Network, Transaction};
use emberchain_mempool::Mempool;
use emberchain_storage::BlockStore;

pub mod message;
pub mod peer;
pub mod sync;

pub use message::{Message, MessageType};
pub use peer::{PeerInfo, PeerManager, PeerState};
pub use sync::{GenesisConfig, SyncError, SyncManager, SyncState};

use message::{AddrPayload, GetBlocksPayload, InvItem, InvPayload, InvType, PingPongPayload, VersionPayload};
use peer::PeerEvent;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer error: {0}")]
    Peer(#[from] peer::PeerError),
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    pub listen_addr: SocketAddr,
    pub seed_peers: Vec<SocketAddr>,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            network: Network::Mainnet,
            listen_addr: "0.0.0.0:8333".parse().unwrap(),
            seed_peers: Vec::new(),
            user_agent: "/emberchain:0.1.0/".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum NetworkCommand {
    Connect(SocketAddr),
    Disconnect(SocketAddr),
    BroadcastBlock(Block),
    BroadcastTransaction(Transaction),
    Shutdown,
}

/// Ties the peer registry and the sync manager together behind one message
/// dispatch loop.
pub struct NetworkService {
    config: NetworkConfig,
    peers: Arc<PeerManager>,
    sync: Arc<SyncManager>,
    command_tx: mpsc::Sender<NetworkCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<NetworkCommand>>>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    nonce: u64,
}

impl NetworkService {
    pub fn new(config: NetworkConfig, blockchain: Arc<Blockchain>, mempool: Arc<Mempool>, block_store: Arc<dyn BlockStore>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(256);
        let peers = Arc::new(PeerManager::new(events_tx));
        let sync = Arc::new(SyncManager::new(blockchain, mempool, block_store));

        Arc::new(NetworkService {
            config,
            peers,
            sync,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            nonce: rand::thread_rng().gen(),
        })
    }

    pub fn command_sender(&self) -> mpsc::Sender<NetworkCommand> {
        self.command_tx.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.peer_count().await
    }

    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers.connected_peers().await
    }

    pub async fn sync_state(&self) -> SyncState {
        self.sync.state().await
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Binds the listener, dials configured seed peers, and starts the
    /// maintenance sweep and the message dispatch loop. Runs until a
    /// `NetworkCommand::Shutdown` is received.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        self.start_listener().await?;
        self.connect_to_seeds().await;
        self.spawn_maintenance();
        self.run().await
    }

    async fn start_listener(self: &Arc<Self>) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("network: listening on {}", self.config.listen_addr);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = this.peers.accept(stream, addr).await {
                            debug!("network: rejected inbound connection from {addr}: {e}");
                        }
                    }
                    Err(e) => {
                        error!("network: listener error: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn connect_to_seeds(self: &Arc<Self>) {
        for seed in self.config.seed_peers.clone() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.peers.connect(seed).await {
                    warn!("network: failed to connect to seed {seed}: {e}");
                }
            });
        }
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(MAINTENANCE_INTERVAL);
            loop {
                ticker.tick().await;
                this.run_maintenance().await;
            }
        });
    }

    async fn run_maintenance(self: &Arc<Self>) {
        for addr in self.peers.ready_peers().await {
            let payload = PingPongPayload { nonce: rand::thread_rng().gen() };
            self.peers.send(addr, Message::new(MessageType::Ping, &payload)).await;
        }
        for addr in self.peers.sweep_idle_peers().await {
            warn!("network: {addr} timed out, disconnecting");
            self.peers.remove(addr).await;
            self.sync.forget_peer(addr).await;
        }
        for (peer, hash) in self.sync.sweep_timed_out_requests().await {
            self.peers.bump_ban_score(peer, 1).await;
            if let Some(retry_to) = self.peers.ready_peers().await.into_iter().find(|a| *a != peer) {
                let payload = InvPayload { items: vec![InvItem { item_type: InvType::Block, hash }] };
                self.peers.send(retry_to, Message::new(MessageType::GetData, &payload)).await;
                self.sync.mark_requested(hash, retry_to).await;
            }
        }
        sync::start_initial_block_download(&self.sync, &self.peers).await;
    }

    async fn run(self: &Arc<Self>) -> Result<(), NetworkError> {
        let mut events_rx = self.events_rx.lock().await.take().expect("network service started twice");
        let mut command_rx = self.command_rx.lock().await.take().expect("network service started twice");

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => {
                    self.handle_event(event).await;
                }
                Some(cmd) = command_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                else => break,
            }
        }
        Ok(())
    }

    async fn handle_command(self: &Arc<Self>, cmd: NetworkCommand) -> bool {
        match cmd {
            NetworkCommand::Connect(addr) => {
                if let Err(e) = self.peers.connect(addr).await {
                    warn!("network: connect to {addr} failed: {e}");
                }
            }
            NetworkCommand::Disconnect(addr) => {
                self.peers.remove(addr).await;
                self.sync.forget_peer(addr).await;
            }
            NetworkCommand::BroadcastBlock(block) => self.broadcast_block(&block).await,
            NetworkCommand::BroadcastTransaction(tx) => self.broadcast_transaction(&tx).await,
            NetworkCommand::Shutdown => {
                info!("network: shutting down");
                return false;
            }
        }
        true
    }

    pub async fn broadcast_block(&self, block: &Block) {
        let payload = InvPayload { items: vec![InvItem { item_type: InvType::Block, hash: block.hash() }] };
        self.peers.broadcast_inv(Message::new(MessageType::Inv, &payload), None).await;
    }

    pub async fn broadcast_transaction(&self, tx: &Transaction) {
        let payload = InvPayload { items: vec![InvItem { item_type: InvType::Tx, hash: tx.txid() }] };
        self.peers.broadcast_inv(Message::new(MessageType::Inv, &payload), None).await;
    }

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, inbound } => {
                self.peers.set_state(addr, PeerState::Handshaking).await;
                if !inbound {
                    self.send_version(addr).await;
                }
            }
            PeerEvent::Disconnected { addr } => {
                self.sync.forget_peer(addr).await;
            }
            PeerEvent::Message { addr, message } => {
                if let Err(e) = self.dispatch_message(addr, message).await {
                    warn!("network: error handling message from {addr}: {e}");
                }
            }
        }
    }

    async fn send_version(&self, addr: SocketAddr) {
        let payload = VersionPayload {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: emberchain_core::current_timestamp(),
            start_height: self.sync.blockchain().height(),
            user_agent: self.config.user_agent.clone(),
            nonce: self.nonce,
        };
        self.peers.send(addr, Message::new(MessageType::Version, &payload)).await;
    }

    async fn dispatch_message(self: &Arc<Self>, addr: SocketAddr, message: Message) -> Result<(), message::MessageError> {
        match message.msg_type {
            MessageType::Version => {
                let payload: VersionPayload = message.decode_payload()?;
                self.peers.record_version(addr, payload.version, payload.services, payload.start_height, payload.user_agent).await;
                self.sync.note_peer_height(addr, payload.start_height).await;
                if self.peers.state_of(addr).await == Some(PeerState::Handshaking) {
                    // Inbound side: we haven't sent our own VERSION yet.
                    self.send_version(addr).await;
                }
                self.peers.send(addr, Message::empty(MessageType::Verack)).await;
                self.peers.set_state(addr, PeerState::Ready).await;
                sync::start_initial_block_download(&self.sync, &self.peers).await;
            }
            MessageType::Verack => {
                self.peers.set_state(addr, PeerState::Ready).await;
                sync::start_initial_block_download(&self.sync, &self.peers).await;
            }
            MessageType::Ping => {
                let payload: PingPongPayload = message.decode_payload()?;
                self.peers.send(addr, Message::new(MessageType::Pong, &payload)).await;
            }
            MessageType::Pong => {}
            MessageType::GetAddr => {
                let addrs = self.peers.connected_peers().await.into_iter().map(|p| p.addr.to_string()).collect();
                self.peers.send(addr, Message::new(MessageType::Addr, &AddrPayload { addrs })).await;
            }
            MessageType::Addr => {
                let payload: AddrPayload = message.decode_payload()?;
                debug!("network: {addr} reported {} peer addresses", payload.addrs.len());
            }
            MessageType::Inv => {
                let payload: InvPayload = message.decode_payload()?;
                let missing = self.sync.missing_items(&payload).await;
                if !missing.is_empty() {
                    for item in &missing {
                        if item.item_type == InvType::Block {
                            self.sync.mark_requested(item.hash, addr).await;
                        }
                    }
                    self.peers.send(addr, Message::new(MessageType::GetData, &InvPayload { items: missing })).await;
                }
            }
            MessageType::GetData => {
                let payload: InvPayload = message.decode_payload()?;
                let mut not_found = Vec::new();
                for item in payload.items {
                    match item.item_type {
                        InvType::Block => match self.sync.block_by_hash(&item.hash) {
                            Some(block) => self.peers.send(addr, message::block_message(&block)).await,
                            None => not_found.push(item),
                        },
                        InvType::Tx => match self.sync.mempool().get(&item.hash) {
                            Some(entry) => self.peers.send(addr, message::tx_message(&entry.tx)).await,
                            None => not_found.push(item),
                        },
                    }
                }
                if !not_found.is_empty() {
                    self.peers.send(addr, Message::new(MessageType::NotFound, &InvPayload { items: not_found })).await;
                }
            }
            MessageType::GetBlocks => {
                let payload: GetBlocksPayload = message.decode_payload()?;
                let inv = self.sync.blocks_following_locator(&payload);
                if !inv.items.is_empty() {
                    self.peers.send_inv(addr, Message::new(MessageType::Inv, &inv)).await;
                }
            }
            MessageType::Block => {
                let block: Block = message.decode_payload()?;
                match self.sync.accept_block(block.clone(), addr).await {
                    Ok(true) => self.broadcast_block(&block).await,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("network: rejected block from {addr}: {e}");
                        self.peers.bump_ban_score(addr, peer::BAN_SCORE_INVALID_BLOCK).await;
                    }
                }
            }
            MessageType::Tx => {
                let tx: Transaction = message.decode_payload()?;
                match self.sync.accept_transaction(tx.clone()) {
                    Ok(true) => self.broadcast_transaction(&tx).await,
                    Ok(false) => {}
                    Err(e) => {
                        debug!("network: rejected tx from {addr}: {e}");
                        self.peers.bump_ban_score(addr, peer::BAN_SCORE_INVALID_TX).await;
                    }
                }
            }
            MessageType::NotFound => {
                let payload: InvPayload = message.decode_payload()?;
                debug!("network: {addr} reports {} items not found", payload.items.len());
            }
        }
        Ok(())
    }
}
