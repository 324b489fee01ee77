//! JSON-file-backed `BlockStore`.
//!
//! One file per block under `<data_dir>/blocks/<hash>.json`, plus
//! `<data_dir>/best_block.json` and `<data_dir>/utxo/snapshot.json`. Chosen
//! for simplicity and debuggability over a binary format or embedded
//! database; a node with a large chain is expected to outgrow this and move
//! to a real KV store, which is why every method is behind the `BlockStore`
//! trait rather than exposed directly.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use emberchain_core::{Block, Hash, Transaction, UtxoRecord};

use crate::{BlockStore, StorageError};

pub struct JsonBlockStore {
    base_dir: PathBuf,
    blocks: RwLock<HashMap<Hash, Block>>,
    block_hashes: RwLock<HashMap<u64, Hash>>,
    best_block_hash: RwLock<Hash>,
    transactions: RwLock<HashMap<Hash, Transaction>>,
    tx_blocks: RwLock<HashMap<Hash, Hash>>,
}

impl JsonBlockStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(base_dir.join("blocks"))?;
        fs::create_dir_all(base_dir.join("utxo"))?;

        let store = JsonBlockStore {
            base_dir,
            blocks: RwLock::new(HashMap::new()),
            block_hashes: RwLock::new(HashMap::new()),
            best_block_hash: RwLock::new([0; 32]),
            transactions: RwLock::new(HashMap::new()),
            tx_blocks: RwLock::new(HashMap::new()),
        };
        store.load_data().await?;
        Ok(store)
    }

    async fn load_data(&self) -> Result<(), StorageError> {
        let blocks_dir = self.base_dir.join("blocks");
        for entry in fs::read_dir(&blocks_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let file = File::open(&path)?;
                let block: Block = serde_json::from_reader(BufReader::new(file))?;
                let hash = block.hash();

                self.block_hashes.write().await.insert(block.height, hash);
                let mut transactions = self.transactions.write().await;
                let mut tx_blocks = self.tx_blocks.write().await;
                for tx in &block.transactions {
                    let txid = tx.txid();
                    transactions.insert(txid, tx.clone());
                    tx_blocks.insert(txid, hash);
                }
                drop(transactions);
                drop(tx_blocks);
                self.blocks.write().await.insert(hash, block);
            }
        }
        debug!("storage: loaded {} blocks from {}", self.blocks.read().await.len(), self.base_dir.display());

        let best_block_path = self.base_dir.join("best_block.json");
        if best_block_path.exists() {
            let file = File::open(&best_block_path)?;
            let best_hash: Hash = serde_json::from_reader(BufReader::new(file))?;
            *self.best_block_hash.write().await = best_hash;
        }
        Ok(())
    }

    async fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let path = self.base_dir.join("blocks").join(format!("{}.json", hex::encode(block.hash())));
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), block)?;
        Ok(())
    }

    async fn save_best_block_hash(&self, hash: &Hash) -> Result<(), StorageError> {
        let path = self.base_dir.join("best_block.json");
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), hash)?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for JsonBlockStore {
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
        drop(transactions);
        drop(tx_blocks);

        self.save_block(block).await?;
        if height == 0 {
            *self.best_block_hash.write().await = hash;
            self.save_best_block_hash(&hash).await?;
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
        self.save_best_block_hash(hash).await
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
        let path = self.base_dir.join("utxo").join("snapshot.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    async fn update_utxo_snapshot(&self, records: &[UtxoRecord]) -> Result<(), StorageError> {
        let path = self.base_dir.join("utxo").join("snapshot.json");
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), records)?;
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
