//! Chain synchronization: the genesis block, block-locator-based initial
//! block download, and inbound block/tx relay handling.
//!
//! `SyncManager` holds no socket state of its own; it only decides what to
//! request or relay next and hands `Message`s back to the caller to send via
//! `PeerManager`. This keeps the consensus/mempool locks out of the peer
//! reader/writer tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::RwLock;

use emberchain_consensus::{Blockchain, ConsensusError};
use emberchain_core::consts::{subsidy, GENESIS_BITS, GENESIS_TIMESTAMP, MAX_INV_BATCH};
use emberchain_core::{Block, BlockHeader, Hash, Network, Transaction, TxOutput};
use emberchain_crypto::Address;
use emberchain_mempool::Mempool;
use emberchain_storage::BlockStore;

use crate::message::{GetBlocksPayload, InvItem, InvPayload, InvType};
use crate::peer::PeerManager;

pub const BLOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("no peers available")]
    NoPeers,
}

/// Coarse progress indicator surfaced to `chain_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing { current_height: u64, target_height: u64 },
    Synced,
}

struct InFlightBlock {
    requested_from: SocketAddr,
    requested_at: Instant,
}

/// Drives initial block download and ongoing relay of blocks and
/// transactions arriving from peers.
pub struct SyncManager {
    blockchain: Arc<Blockchain>,
    mempool: Arc<Mempool>,
    block_store: Arc<dyn BlockStore>,
    state: RwLock<SyncState>,
    blocks_in_flight: RwLock<HashMap<Hash, InFlightBlock>>,
    peer_heights: RwLock<HashMap<SocketAddr, u64>>,
}

impl SyncManager {
    pub fn new(blockchain: Arc<Blockchain>, mempool: Arc<Mempool>, block_store: Arc<dyn BlockStore>) -> Self {
        SyncManager {
            blockchain,
            mempool,
            block_store,
            state: RwLock::new(SyncState::Idle),
            blocks_in_flight: RwLock::new(HashMap::new()),
            peer_heights: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    pub async fn note_peer_height(&self, addr: SocketAddr, height: u64) {
        self.peer_heights.write().await.insert(addr, height);
        self.refresh_state().await;
    }

    pub async fn forget_peer(&self, addr: SocketAddr) {
        self.peer_heights.write().await.remove(&addr);
        self.refresh_state().await;
    }

    async fn refresh_state(&self) {
        let our_height = self.blockchain.height();
        let best_known = self.peer_heights.read().await.values().copied().max().unwrap_or(our_height);
        let mut state = self.state.write().await;
        *state = if best_known > our_height {
            SyncState::Syncing { current_height: our_height, target_height: best_known }
        } else {
            SyncState::Synced
        };
    }

    /// Builds a Bitcoin-Core-style block locator: the most recent ten block
    /// hashes, then exponentially-spaced hashes back towards genesis.
    pub fn build_locator(&self) -> Vec<Hash> {
        let tip = self.blockchain.height();
        let mut locator = Vec::new();
        let mut step = 1u64;
        let mut height = tip;
        loop {
            if let Some(block) = self.blockchain.block_at(height) {
                locator.push(block.hash());
            }
            if height == 0 {
                break;
            }
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step);
        }
        locator
    }

    /// Responds to a GETBLOCKS request: finds the first locator hash present
    /// in the local chain, then returns an INV of up to `MAX_INV_BATCH`
    /// blocks following it.
    pub fn blocks_following_locator(&self, request: &GetBlocksPayload) -> InvPayload {
        let mut start_height = 0;
        for hash in &request.locator {
            if let Some(height) = self.height_of(hash) {
                start_height = height + 1;
                break;
            }
        }
        let tip = self.blockchain.height();
        let mut items = Vec::new();
        let mut height = start_height;
        while height <= tip && items.len() < MAX_INV_BATCH {
            if let Some(block) = self.blockchain.block_at(height) {
                let hash = block.hash();
                items.push(InvItem { item_type: InvType::Block, hash });
                if hash == request.stop_hash {
                    break;
                }
            }
            height += 1;
        }
        InvPayload { items }
    }

    fn height_of(&self, hash: &Hash) -> Option<u64> {
        (0..=self.blockchain.height()).rev().find(|&h| self.blockchain.block_at(h).map(|b| b.hash() == *hash).unwrap_or(false))
    }

    /// Looks up a block by hash among the blocks we hold, for serving GETDATA.
    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.height_of(hash).and_then(|height| self.blockchain.block_at(height))
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    /// Decides which items from an inbound INV are worth requesting.
    pub async fn missing_items(&self, inv: &InvPayload) -> Vec<InvItem> {
        let mut missing = Vec::new();
        for item in &inv.items {
            let already_have = match item.item_type {
                InvType::Block => self.height_of(&item.hash).is_some() || self.blocks_in_flight.read().await.contains_key(&item.hash),
                InvType::Tx => self.mempool.contains(&item.hash) || self.block_store.has_transaction(&item.hash).await.unwrap_or(false),
            };
            if !already_have {
                missing.push(*item);
            }
        }
        missing
    }

    pub async fn mark_requested(&self, hash: Hash, from: SocketAddr) {
        self.blocks_in_flight.write().await.insert(hash, InFlightBlock { requested_from: from, requested_at: Instant::now() });
    }

    /// Re-requests blocks that have been in flight longer than
    /// `BLOCK_REQUEST_TIMEOUT`, returning `(peer_to_ban, hash_to_retry)`
    /// pairs for the caller to act on.
    pub async fn sweep_timed_out_requests(&self) -> Vec<(SocketAddr, Hash)> {
        let mut timed_out = Vec::new();
        let mut in_flight = self.blocks_in_flight.write().await;
        let now = Instant::now();
        in_flight.retain(|hash, entry| {
            if now.duration_since(entry.requested_at) > BLOCK_REQUEST_TIMEOUT {
                timed_out.push((entry.requested_from, *hash));
                false
            } else {
                true
            }
        });
        timed_out
    }

    /// Applies a block received from a peer. Returns `Ok(true)` if it
    /// extended the chain (and so should be relayed onward), `Ok(false)` if
    /// it was already known, `Err` if it failed validation (the caller
    /// should bump the sending peer's ban score).
    pub async fn accept_block(&self, block: Block, from: SocketAddr) -> Result<bool, SyncError> {
        let hash = block.hash();
        self.blocks_in_flight.write().await.remove(&hash);
        if self.height_of(&hash).is_some() {
            debug!("sync: ignoring already-known block {} from {from}", hex::encode(hash));
            return Ok(false);
        }
        self.blockchain.accept_block(block.clone())?;
        self.block_store.store_block(&block).await.map_err(|e| SyncError::Storage(e.to_string()))?;
        self.block_store.set_best_block(&hash).await.map_err(|e| SyncError::Storage(e.to_string()))?;
        self.mempool.remove_confirmed(&block);
        self.refresh_state().await;
        info!("sync: accepted block {} at height {} from {from}", hex::encode(hash), block.height);
        Ok(true)
    }

    /// Admits a transaction received from a peer into the mempool. Returns
    /// `Ok(true)` if it was newly admitted (and so should be relayed).
    pub fn accept_transaction(&self, tx: Transaction) -> Result<bool, emberchain_mempool::MempoolError> {
        let txid = tx.txid();
        if self.mempool.contains(&txid) {
            return Ok(false);
        }
        self.mempool.admit(tx, &self.blockchain, emberchain_core::current_timestamp())?;
        Ok(true)
    }

    pub fn blockchain(&self) -> &Arc<Blockchain> {
        &self.blockchain
    }
}

/// Starts initial block download against whichever ready peer reports the
/// tallest chain, sending it a GETBLOCKS built from our locator.
pub async fn start_initial_block_download(sync: &Arc<SyncManager>, peers: &Arc<PeerManager>) {
    let ready = peers.connected_peers().await;
    let Some(best) = ready.iter().filter(|p| p.state == crate::peer::PeerState::Ready).max_by_key(|p| p.start_height) else {
        warn!("sync: no ready peers for initial block download");
        return;
    };
    if best.start_height <= sync.blockchain.height() {
        return;
    }
    let locator = sync.build_locator();
    let payload = GetBlocksPayload { locator, stop_hash: [0u8; 32] };
    let msg = crate::message::Message::new(crate::message::MessageType::GetBlocks, &payload);
    peers.send(best.addr, msg).await;
}

/// Network-specific genesis block parameters. `nonce` is precomputed offline
/// for `mainnet`/`testnet` (their `bits` require a real proof-of-work search,
/// not something to redo on every startup); only `regtest`'s trivial target
/// is still searched live, for convenience.
#[derive(Debug, Clone, Copy)]
pub struct GenesisConfig {
    pub network: Network,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: Option<u64>,
}

impl GenesisConfig {
    pub fn mainnet() -> Self {
        GenesisConfig { network: Network::Mainnet, timestamp: GENESIS_TIMESTAMP, bits: GENESIS_BITS, nonce: Some(3_835_641_881) }
    }

    pub fn testnet() -> Self {
        GenesisConfig { network: Network::Testnet, timestamp: GENESIS_TIMESTAMP, bits: GENESIS_BITS, nonce: Some(3_072_918_289) }
    }

    /// Regtest keeps the same timestamp but mines trivially (every hash
    /// meets the target), so blocks can be produced instantly in tests.
    pub fn regtest() -> Self {
        GenesisConfig { network: Network::Regtest, timestamp: GENESIS_TIMESTAMP, bits: 0x207f_ffff, nonce: None }
    }

    /// chain_id must agree with `ConsensusParams::{mainnet,testnet,regtest}`,
    /// which the `Network` enum's own discriminant does not match.
    fn chain_id(&self) -> u32 {
        match self.network {
            Network::Mainnet => 1,
            Network::Testnet => 2,
            Network::Regtest => 3,
        }
    }

    /// Builds the genesis block for this network: a single coinbase
    /// transaction paying the first subsidy to a well-known, keyless address
    /// (hash160 of all zero bytes). Uses the precomputed `nonce` when one is
    /// set; otherwise brute-forces one from zero (only ever fast enough to
    /// matter for regtest's trivial target).
    pub fn create_genesis_block(&self) -> Block {
        let address = Address::from_hash160([0u8; 20]);
        let coinbase = Transaction {
            version: 1,
            chain_id: self.chain_id(),
            inputs: Vec::new(),
            outputs: vec![TxOutput { amount: subsidy(0), script_pubkey: address.to_base58check() }],
            locktime: 0,
        };
        let merkle_root = emberchain_core::merkle_root(&[coinbase.txid()]);

        let mut header = BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root,
            timestamp: self.timestamp,
            bits: self.bits,
            nonce: 0,
        };

        match self.nonce {
            Some(nonce) => header.nonce = nonce,
            None => {
                let target = emberchain_consensus::difficulty::get_target_from_bits(self.bits);
                while !emberchain_consensus::difficulty::hash_meets_target(&header.hash(), &target) {
                    header.nonce += 1;
                }
            }
        }

        Block { header, height: 0, transactions: vec![coinbase] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regtest_genesis_meets_its_own_trivial_target() {
        let block = GenesisConfig::regtest().create_genesis_block();
        let target = emberchain_consensus::difficulty::get_target_from_bits(block.header.bits);
        assert!(emberchain_consensus::difficulty::hash_meets_target(&block.hash(), &target));
        assert!(block.merkle_root_matches());
        assert!(block.has_exactly_one_coinbase());
    }
}
