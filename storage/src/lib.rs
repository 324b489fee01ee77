//! Block and UTXO persistence.
//!
//! The node keeps its authoritative state in memory (`Blockchain`,
//! `UTXOSet`); this crate is only responsible for making that state durable
//! across restarts. The default implementation writes one JSON file per
//! block plus a UTXO snapshot under a data directory; a `MemoryBlockStore`
//! backs tests and `--datadir` configurations that opt out of persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod json_store;

use emberchain_core::{Block, Hash, Transaction, UtxoRecord};

pub use json_store::JsonBlockStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Durable storage for blocks, the UTXO snapshot, and the transaction index.
///
/// `get_utxo_snapshot`/`update_utxo_snapshot` traffic in `UtxoRecord` lists
/// rather than a live `UTXOSet`, since the set holds its entries behind a
/// lock and is neither `Clone` nor directly serializable.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn store_block(&self, block: &Block) -> Result<(), StorageError>;
    async fn get_block(&self, hash: &Hash) -> Result<Block, StorageError>;
    async fn has_block(&self, hash: &Hash) -> Result<bool, StorageError>;
    async fn get_block_hash(&self, height: u64) -> Result<Hash, StorageError>;
    async fn get_best_block_hash(&self) -> Result<Hash, StorageError>;
    async fn get_best_block_height(&self) -> Result<u64, StorageError>;
    async fn set_best_block(&self, hash: &Hash) -> Result<(), StorageError>;
    async fn get_blocks_by_height_range(&self, start: u64, end: u64) -> Result<Vec<Block>, StorageError>;
    async fn get_utxo_snapshot(&self) -> Result<Vec<UtxoRecord>, StorageError>;
    async fn update_utxo_snapshot(&self, records: &[UtxoRecord]) -> Result<(), StorageError>;
    async fn get_transaction(&self, txid: &Hash) -> Result<Transaction, StorageError>;
    async fn has_transaction(&self, txid: &Hash) -> Result<bool, StorageError>;
    async fn get_transaction_block(&self, txid: &Hash) -> Result<Hash, StorageError>;
}

/// In-memory `BlockStore`, used by tests and `regtest` runs that don't need
/// data to survive a restart.
pub struct MemoryBlockStore {
    blocks: tokio::sync::RwLock<HashMap<Hash, Block>>,
    block_hashes: tokio::sync::RwLock<HashMap<u64, Hash>>,
    best_block_hash: tokio::sync::RwLock<Hash>,
    utxo_snapshot: tokio::sync::RwLock<Vec<UtxoRecord>>,
    transactions: tokio::sync::RwLock<HashMap<Hash, Transaction>>,
    tx_blocks: tokio::sync::RwLock<HashMap<Hash, Hash>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        MemoryBlockStore {
            blocks: tokio::sync::RwLock::new(HashMap::new()),
            block_hashes: tokio::sync::RwLock::new(HashMap::new()),
            best_block_hash: tokio::sync::RwLock::new([0; 32]),
            utxo_snapshot: tokio::sync::RwLock::new(Vec::new()),
            transactions: tokio::sync::RwLock::new(HashMap::new()),
            tx_blocks: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn store_block(&self, block: &Block) -> Result<(), StorageError> {
        let hash = block.hash();
        let height = block.height;

        self.blocks.write().await.insert(hash, block.clone());
        self.block_hashes.write().await.insert(height, hash);

        let mut transactions = self.transactions.write().await;
        let mut tx_blocks = self.tx_blocks.write().await;
        for tx in &block.transactions {
            let txid = tx.txid();
            transactions.insert(txid, tx.clone());
            tx_blocks.insert(txid, hash);
        }

        if height == 0 {
            *self.best_block_hash.write().await = hash;
        }
        Ok(())
    }

    async fn get_block(&self, hash: &Hash) -> Result<Block, StorageError> {
        self.blocks
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("block {}", hex::encode(hash))))
    }

    async fn has_block(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.blocks.read().await.contains_key(hash))
    }

    async fn get_block_hash(&self, height: u64) -> Result<Hash, StorageError> {
        self.block_hashes
            .read()
            .await
            .get(&height)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("block at height {height}")))
    }

    async fn get_best_block_hash(&self) -> Result<Hash, StorageError> {
        Ok(*self.best_block_hash.read().await)
    }

    async fn get_best_block_height(&self) -> Result<u64, StorageError> {
        let hash = *self.best_block_hash.read().await;
        Ok(self.get_block(&hash).await?.height)
    }

    async fn set_best_block(&self, hash: &Hash) -> Result<(), StorageError> {
        if !self.has_block(hash).await? {
            return Err(StorageError::NotFound(format!("block {}", hex::encode(hash))));
        }
        *self.best_block_hash.write().await = *hash;
        Ok(())
    }

    async fn get_blocks_by_height_range(&self, start: u64, end: u64) -> Result<Vec<Block>, StorageError> {
        let block_hashes = self.block_hashes.read().await;
        let blocks = self.blocks.read().await;
        Ok((start..=end)
            .filter_map(|height| block_hashes.get(&height))
            .filter_map(|hash| blocks.get(hash).cloned())
            .collect())
    }

    async fn get_utxo_snapshot(&self) -> Result<Vec<UtxoRecord>, StorageError> {
        Ok(self.utxo_snapshot.read().await.clone())
    }

    async fn update_utxo_snapshot(&self, records: &[UtxoRecord]) -> Result<(), StorageError> {
        *self.utxo_snapshot.write().await = records.to_vec();
        Ok(())
    }

    async fn get_transaction(&self, txid: &Hash) -> Result<Transaction, StorageError> {
        self.transactions
            .read()
            .await
            .get(txid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("transaction {}", hex::encode(txid))))
    }

    async fn has_transaction(&self, txid: &Hash) -> Result<bool, StorageError> {
        Ok(self.transactions.read().await.contains_key(txid))
    }

    async fn get_transaction_block(&self, txid: &Hash) -> Result<Hash, StorageError> {
        self.tx_blocks
            .read()
            .await
            .get(txid)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("transaction {}", hex::encode(txid))))
    }
}

/// Storage configuration, loaded as part of the node's top-level config file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { data_dir: ".emberchain".to_string(), persist: true }
    }
}

/// Builds the configured `BlockStore`: `JsonBlockStore` under `data_dir` when
/// `persist` is set, otherwise a non-durable `MemoryBlockStore`.
pub async fn create_block_store(config: &StorageConfig) -> Result<Arc<dyn BlockStore>, StorageError> {
    if config.persist {
        let store = JsonBlockStore::new(std::path::PathBuf::from(&config.data_dir)).await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(MemoryBlockStore::new()))
    }
}
