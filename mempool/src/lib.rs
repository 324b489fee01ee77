//! The mempool: the set of valid, unconfirmed transactions awaiting
//! inclusion in a block.
//!
//! Has no teacher counterpart (the source repo hands transactions straight
//! to its miner); grounded on the admission/reapply-and-evict shape common
//! to the pack's mempool implementations, expressed with a `RwLock`-guarded
//! interior matching `UTXOSet`'s own concurrency style and `log`-crate
//! tracing at the same admission/eviction call sites the teacher instruments
//! elsewhere.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use log::{debug, info, warn};
use thiserror::Error;

use emberchain_core::consts::{MAX_MEMPOOL_BYTES, MIN_RELAY_FEE};
use emberchain_core::{validate_transaction, Block, Hash, LayeredUtxoView, OutPoint, Transaction, TxError};
use emberchain_consensus::Blockchain;

#[derive(Error, Debug)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    AlreadyPresent,
    #[error("transaction conflicts with an already-admitted mempool transaction spending {0:?}")]
    Conflict(OutPoint),
    #[error("transaction rejected: {0}")]
    Invalid(#[from] TxError),
    #[error("fee rate {got}/kB below minimum relay fee {want}/kB")]
    FeeTooLow { got: u64, want: u64 },
    #[error("mempool is full and this transaction's fee rate is not high enough to evict room for it")]
    MempoolFull,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub received_at: u64,
    pub fee: u64,
    /// Fee rate in base units per kilobyte, truncated to an integer so
    /// selection order stays deterministic across platforms.
    pub fee_rate: u64,
}

struct Inner {
    entries: HashMap<Hash, MempoolEntry>,
    reserved: HashMap<OutPoint, Hash>,
}

/// Guarded by its own `std::sync::RwLock`, held briefly and never while
/// holding the blockchain-state lock (the reverse nesting order is fine).
pub struct Mempool {
    inner: RwLock<Inner>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool { inner: RwLock::new(Inner { entries: HashMap::new(), reserved: HashMap::new() }) }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.inner.read().unwrap().entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<MempoolEntry> {
        self.inner.read().unwrap().entries.get(txid).cloned()
    }

    /// Validates `tx` against `chain`'s UTXO set (layered with other pending
    /// mempool transactions so chains of unconfirmed spends can admit), then
    /// inserts it and reserves its inputs.
    pub fn admit(&self, tx: Transaction, chain: &Blockchain, now: u64) -> Result<(), MempoolError> {
        let txid = tx.txid();
        let mut inner = self.inner.write().unwrap();

        if inner.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyPresent);
        }
        for input in &tx.inputs {
            if let Some(&conflicting) = inner.reserved.get(&input.prev) {
                warn!("mempool: rejecting {} - conflicts with {} on {:?}", hex_short(&txid), hex_short(&conflicting), input.prev);
                return Err(MempoolError::Conflict(input.prev));
            }
        }

        let mut overlay = LayeredUtxoView::new(chain.utxo_set());
        for entry in inner.entries.values() {
            let entry_txid = entry.tx.txid();
            for (vout, output) in entry.tx.outputs.iter().enumerate() {
                overlay.add_output(OutPoint::new(entry_txid, vout as u32), output.clone(), chain.height() + 1, false);
            }
        }

        let fee = validate_transaction(
            &tx,
            &overlay,
            chain.params().chain_id,
            chain.params().max_tx_size,
            chain.height() + 1,
            chain.params().coinbase_maturity,
        )?;

        let size_bytes = encoded_len(&tx).max(1) as u64;
        let fee_rate = fee.saturating_mul(1000) / size_bytes;

        if fee_rate < MIN_RELAY_FEE {
            debug!("mempool: rejecting {} - fee_rate {}/kB below minimum {}/kB", hex_short(&txid), fee_rate, MIN_RELAY_FEE);
            return Err(MempoolError::FeeTooLow { got: fee_rate, want: MIN_RELAY_FEE });
        }

        let mut total_bytes: u64 = inner.entries.values().map(|e| encoded_len(&e.tx) as u64).sum();
        if total_bytes.saturating_add(size_bytes) > MAX_MEMPOOL_BYTES as u64 {
            let mut by_fee_rate: Vec<Hash> = inner.entries.iter().map(|(txid, e)| (*txid, e.fee_rate)).collect::<Vec<_>>().into_iter().map(|(txid, _)| txid).collect();
            by_fee_rate.sort_by_key(|txid| inner.entries[txid].fee_rate);

            for victim in by_fee_rate {
                if total_bytes.saturating_add(size_bytes) <= MAX_MEMPOOL_BYTES as u64 {
                    break;
                }
                let victim_rate = inner.entries[&victim].fee_rate;
                if victim_rate >= fee_rate {
                    // Every remaining entry pays at least as much as the newcomer: it
                    // would itself be the lowest-fee-rate entry and gains no room.
                    return Err(MempoolError::MempoolFull);
                }
                if let Some(entry) = inner.entries.remove(&victim) {
                    total_bytes = total_bytes.saturating_sub(encoded_len(&entry.tx) as u64);
                    for input in &entry.tx.inputs {
                        inner.reserved.remove(&input.prev);
                    }
                    warn!("mempool: evicted {} (fee_rate={}/kB) to make room for {}", hex_short(&victim), victim_rate, hex_short(&txid));
                }
            }
            if total_bytes.saturating_add(size_bytes) > MAX_MEMPOOL_BYTES as u64 {
                return Err(MempoolError::MempoolFull);
            }
        }

        for input in &tx.inputs {
            inner.reserved.insert(input.prev, txid);
        }
        info!("mempool: admitted {} fee={} fee_rate={}/kB", hex_short(&txid), fee, fee_rate);
        inner.entries.insert(txid, MempoolEntry { tx, received_at: now, fee, fee_rate });
        Ok(())
    }

    /// Removes every transaction confirmed by `block`, releases the
    /// outpoints they had reserved, and also sweeps any remaining mempool
    /// transaction whose inputs were spent by a *different* transaction in
    /// the block (now a double-spend against the confirmed chain). Called
    /// after `Blockchain::accept_block`.
    pub fn remove_confirmed(&self, block: &Block) {
        let mut inner = self.inner.write().unwrap();
        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in block.transactions.iter().skip(1) {
            let txid = tx.txid();
            for input in &tx.inputs {
                spent.insert(input.prev);
            }
            if let Some(entry) = inner.entries.remove(&txid) {
                for input in &entry.tx.inputs {
                    inner.reserved.remove(&input.prev);
                }
                debug!("mempool: purged confirmed tx {}", hex_short(&txid));
            }
        }

        let now_conflicting: Vec<Hash> = inner
            .entries
            .values()
            .filter(|entry| entry.tx.inputs.iter().any(|input| spent.contains(&input.prev)))
            .map(|entry| entry.tx.txid())
            .collect();
        for txid in now_conflicting {
            if let Some(entry) = inner.entries.remove(&txid) {
                for input in &entry.tx.inputs {
                    inner.reserved.remove(&input.prev);
                }
                warn!("mempool: purged {} - inputs double-spent by confirmed block", hex_short(&txid));
            }
        }
    }

    /// Evicts entries older than `expiry_secs` relative to `now`.
    pub fn evict_expired(&self, now: u64, expiry_secs: u64) {
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<Hash> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.received_at) > expiry_secs)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in expired {
            if let Some(entry) = inner.entries.remove(&txid) {
                for input in &entry.tx.inputs {
                    inner.reserved.remove(&input.prev);
                }
                warn!("mempool: evicted expired tx {}", hex_short(&txid));
            }
        }
    }

    /// Greedily selects transactions by descending fee rate for inclusion in
    /// a candidate block, respecting intra-mempool dependencies (a child
    /// spending a still-unconfirmed parent's output is only selected once
    /// its parent has been), until `max_bytes` or `max_sigops` is reached.
    pub fn select_for_block(&self, max_bytes: usize, max_sigops: usize) -> Vec<Transaction> {
        let inner = self.inner.read().unwrap();
        let mut candidates: Vec<&MempoolEntry> = inner.entries.values().collect();
        candidates.sort_by(|a, b| b.fee_rate.cmp(&a.fee_rate));

        let mut selected = Vec::new();
        let mut selected_ids: HashSet<Hash> = HashSet::new();
        let mut available_outputs: HashSet<OutPoint> = HashSet::new();
        let mut used_bytes = 0usize;
        let mut used_sigops = 0usize;

        let mut progressed = true;
        while progressed {
            progressed = false;
            for entry in &candidates {
                let txid = entry.tx.txid();
                if selected_ids.contains(&txid) {
                    continue;
                }
                let deps_satisfied = entry.tx.inputs.iter().all(|input| !is_unconfirmed_parent(&candidates, &input.prev) || available_outputs.contains(&input.prev));
                if !deps_satisfied {
                    continue;
                }

                let tx_bytes = encoded_len(&entry.tx);
                let tx_sigops = entry.tx.inputs.len().max(1);
                if used_bytes + tx_bytes > max_bytes || used_sigops + tx_sigops > max_sigops {
                    continue;
                }

                used_bytes += tx_bytes;
                used_sigops += tx_sigops;
                selected_ids.insert(txid);
                for (vout, _) in entry.tx.outputs.iter().enumerate() {
                    available_outputs.insert(OutPoint::new(txid, vout as u32));
                }
                selected.push(entry.tx.clone());
                progressed = true;
            }
        }

        selected
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

fn is_unconfirmed_parent(candidates: &[&MempoolEntry], outpoint: &OutPoint) -> bool {
    candidates.iter().any(|e| e.tx.txid() == outpoint.txid)
}

fn encoded_len(tx: &Transaction) -> usize {
    emberchain_core::codec::encode_to_vec(tx).len()
}

fn hex_short(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberchain_consensus::ConsensusParams;
    use emberchain_core::{consts, merkle_root, BlockHeader, TxInput, TxOutput};
    use emberchain_crypto::generate_keypair;

    fn mine_trivial(mut header: BlockHeader) -> BlockHeader {
        let target = emberchain_consensus::get_target_from_bits(header.bits);
        loop {
            if emberchain_consensus::hash_meets_target(&header.hash(), &target) {
                return header;
            }
            header.nonce += 1;
        }
    }

    fn test_chain() -> (Blockchain, emberchain_crypto::Address, secp256k1::SecretKey, secp256k1::PublicKey) {
        let (sk, pk, addr) = generate_keypair();
        let params = ConsensusParams::regtest();
        let coinbase = Transaction {
            version: 1,
            chain_id: params.chain_id,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 50 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        let txid = coinbase.txid();
        let header = BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: merkle_root(&[txid]),
            timestamp: consts::GENESIS_TIMESTAMP,
            bits: params.genesis_bits,
            nonce: 0,
        };
        let header = mine_trivial(header);
        let genesis = Block { header, height: 0, transactions: vec![coinbase] };
        let chain = Blockchain::new(params, genesis).unwrap();
        (chain, addr, sk, pk)
    }

    #[test]
    fn admits_well_formed_spend() {
        let (chain, addr, sk, pk) = test_chain();
        let genesis_txid = chain.block_at(0).unwrap().transactions[0].txid();
        let mempool = Mempool::new();

        let mut tx = Transaction {
            version: 1,
            chain_id: chain.params().chain_id,
            inputs: vec![TxInput { prev: OutPoint::new(genesis_txid, 0), signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![TxOutput { amount: 49 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();

        mempool.admit(tx, &chain, 1).unwrap();
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn rejects_second_spend_of_same_outpoint() {
        let (chain, addr, sk, pk) = test_chain();
        let genesis_txid = chain.block_at(0).unwrap().transactions[0].txid();
        let mempool = Mempool::new();

        let mut tx1 = Transaction {
            version: 1,
            chain_id: chain.params().chain_id,
            inputs: vec![TxInput { prev: OutPoint::new(genesis_txid, 0), signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![TxOutput { amount: 40 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        tx1.sign_input(0, &sk, &pk).unwrap();
        mempool.admit(tx1, &chain, 1).unwrap();

        let mut tx2 = Transaction {
            version: 1,
            chain_id: chain.params().chain_id,
            inputs: vec![TxInput { prev: OutPoint::new(genesis_txid, 0), signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![TxOutput { amount: 41 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        tx2.sign_input(0, &sk, &pk).unwrap();

        let err = mempool.admit(tx2, &chain, 1).unwrap_err();
        assert!(matches!(err, MempoolError::Conflict(_)));
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn remove_confirmed_releases_reservation() {
        let (chain, addr, sk, pk) = test_chain();
        let genesis_txid = chain.block_at(0).unwrap().transactions[0].txid();
        let mempool = Mempool::new();

        let mut tx = Transaction {
            version: 1,
            chain_id: chain.params().chain_id,
            inputs: vec![TxInput { prev: OutPoint::new(genesis_txid, 0), signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![TxOutput { amount: 49 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();
        mempool.admit(tx.clone(), &chain, 1).unwrap();

        let block = Block {
            header: BlockHeader { version: 1, prev_hash: [0; 32], merkle_root: [0; 32], timestamp: 0, bits: 0, nonce: 0 },
            height: 1,
            transactions: vec![
                Transaction { version: 1, chain_id: 1, inputs: vec![], outputs: vec![TxOutput { amount: 1, script_pubkey: addr.to_base58check() }], locktime: 0 },
                tx,
            ],
        };
        mempool.remove_confirmed(&block);
        assert_eq!(mempool.len(), 0);
    }

    #[test]
    fn select_for_block_orders_by_fee_rate() {
        let (chain, addr, sk, pk) = test_chain();
        let genesis_txid = chain.block_at(0).unwrap().transactions[0].txid();
        let mempool = Mempool::new();

        let mut high_fee = Transaction {
            version: 1,
            chain_id: chain.params().chain_id,
            inputs: vec![TxInput { prev: OutPoint::new(genesis_txid, 0), signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![TxOutput { amount: 10 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        high_fee.sign_input(0, &sk, &pk).unwrap();
        mempool.admit(high_fee.clone(), &chain, 1).unwrap();

        let selected = mempool.select_for_block(1_000_000, 10_000);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].txid(), high_fee.txid());
    }
}
