//! The UTXO set: the authoritative mapping from `OutPoint` to `TxOutput`,
//! with atomic block-apply/rollback and a layered-overlay view for
//! validating transactions that spend each other's not-yet-committed
//! outputs (in-block or in-mempool).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use log::{debug, warn};
use thiserror::Error;

use crate::block::Block;
use crate::transaction::{OutPoint, TxOutput};

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("block spends {0:?} which does not exist in the UTXO set")]
    MissingInput(OutPoint),
    #[error("block spends {0:?} more than once")]
    DoubleSpendWithinBlock(OutPoint),
}

/// A read-only view over spendable outputs, implemented both by the bare
/// `UTXOSet` and by `LayeredUtxoView`, an overlay combining a base view with
/// a set of not-yet-committed spends and outputs (prior transactions in the
/// same block, or other transactions already admitted to the mempool).
pub trait UtxoView {
    fn get(&self, outpoint: &OutPoint) -> Option<TxOutput>;
    fn source_height(&self, outpoint: &OutPoint) -> Option<u64>;
    fn is_coinbase(&self, outpoint: &OutPoint) -> bool;
    /// True if `outpoint` is known to have already been spent by a
    /// transaction earlier in this same validation pass (overlay-only;
    /// the base UTXOSet never reports a spent output as spent, since a
    /// spent output is simply absent from it).
    fn is_spent(&self, outpoint: &OutPoint) -> bool;
}

#[derive(Debug, Clone)]
struct UtxoEntry {
    output: TxOutput,
    source_height: u64,
    is_coinbase: bool,
}

/// An overlay combining a base view with not-yet-committed spends/outputs.
/// Used for in-block transaction ordering and for mempool admission, where
/// a transaction may spend the output of an earlier transaction that has
/// not yet been applied to the `UTXOSet`.
pub struct LayeredUtxoView<'a> {
    base: &'a dyn UtxoView,
    extra_outputs: HashMap<OutPoint, (TxOutput, u64, bool)>,
    extra_spends: HashSet<OutPoint>,
}

impl<'a> LayeredUtxoView<'a> {
    pub fn new(base: &'a dyn UtxoView) -> Self {
        LayeredUtxoView { base, extra_outputs: HashMap::new(), extra_spends: HashSet::new() }
    }

    /// Records an output produced by a transaction not yet committed to the
    /// base view (e.g. an earlier transaction in the same candidate block).
    pub fn add_output(&mut self, outpoint: OutPoint, output: TxOutput, source_height: u64, is_coinbase: bool) {
        self.extra_outputs.insert(outpoint, (output, source_height, is_coinbase));
    }

    /// Marks an outpoint as spent within this overlay, whether it was a
    /// base-view output or one added via `add_output`.
    pub fn mark_spent(&mut self, outpoint: OutPoint) {
        self.extra_outputs.remove(&outpoint);
        self.extra_spends.insert(outpoint);
    }
}

impl<'a> UtxoView for LayeredUtxoView<'a> {
    fn get(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        if self.extra_spends.contains(outpoint) {
            return None;
        }
        if let Some((output, _, _)) = self.extra_outputs.get(outpoint) {
            return Some(output.clone());
        }
        self.base.get(outpoint)
    }

    fn source_height(&self, outpoint: &OutPoint) -> Option<u64> {
        if let Some((_, height, _)) = self.extra_outputs.get(outpoint) {
            return Some(*height);
        }
        self.base.source_height(outpoint)
    }

    fn is_coinbase(&self, outpoint: &OutPoint) -> bool {
        if let Some((_, _, coinbase)) = self.extra_outputs.get(outpoint) {
            return *coinbase;
        }
        self.base.is_coinbase(outpoint)
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.extra_spends.contains(outpoint) || self.base.is_spent(outpoint)
    }
}

/// Removed (and, separately, added) entries from one `apply_block` call,
/// sufficient to restore the `UTXOSet` to its pre-apply state.
#[derive(Debug, Clone)]
pub struct Undo {
    removed: Vec<(OutPoint, TxOutput, u64, bool)>,
    added: Vec<OutPoint>,
}

/// The authoritative set of spendable outputs.
///
/// Guarded by a `std::sync::RwLock` rather than an async lock: the UTXO set
/// is read and written from both the synchronous rayon mining threads and
/// the node's main blockchain-state path, never from bare `tokio` tasks
/// directly (those go through the blockchain-state lock instead).
pub struct UTXOSet {
    entries: RwLock<HashMap<OutPoint, UtxoEntry>>,
}

impl UTXOSet {
    pub fn new() -> Self {
        UTXOSet { entries: RwLock::new(HashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies every transaction in `block` in order: removes spent inputs,
    /// inserts new outputs. On any missing or doubly-spent input, no change
    /// is made and an error is returned (the caller need not roll back).
    pub fn apply_block(&self, block: &Block) -> Result<Undo, ApplyError> {
        let mut entries = self.entries.write().unwrap();
        let mut removed = Vec::new();
        let mut added = Vec::new();
        let mut spent_this_block: HashSet<OutPoint> = HashSet::new();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let is_coinbase = tx_index == 0;
            if !is_coinbase {
                for input in &tx.inputs {
                    if spent_this_block.contains(&input.prev) {
                        warn!("utxo: rejecting block at height {} - {:?} double-spent within the block", block.height, input.prev);
                        Self::undo_partial(&mut entries, &removed, &added);
                        return Err(ApplyError::DoubleSpendWithinBlock(input.prev));
                    }
                    let entry = match entries.remove(&input.prev) {
                        Some(entry) => entry,
                        None => {
                            warn!("utxo: rejecting block at height {} - missing input {:?}", block.height, input.prev);
                            Self::undo_partial(&mut entries, &removed, &added);
                            return Err(ApplyError::MissingInput(input.prev));
                        }
                    };
                    spent_this_block.insert(input.prev);
                    removed.push((input.prev, entry.output, entry.source_height, entry.is_coinbase));
                }
            }

            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, vout as u32);
                entries.insert(
                    outpoint,
                    UtxoEntry { output: output.clone(), source_height: block.height, is_coinbase },
                );
                added.push(outpoint);
            }
        }

        debug!("utxo: applied block at height {} - {} spent, {} created", block.height, removed.len(), added.len());
        Ok(Undo { removed, added })
    }

    fn undo_partial(
        entries: &mut HashMap<OutPoint, UtxoEntry>,
        removed: &[(OutPoint, TxOutput, u64, bool)],
        added: &[OutPoint],
    ) {
        for outpoint in added {
            entries.remove(outpoint);
        }
        for (outpoint, output, source_height, is_coinbase) in removed {
            entries.insert(
                *outpoint,
                UtxoEntry { output: output.clone(), source_height: *source_height, is_coinbase: *is_coinbase },
            );
        }
    }

    /// Restores the set to its state before the `apply_block` call that
    /// produced `undo`: re-inserts removed outputs, deletes added ones.
    pub fn rollback(&self, undo: Undo) {
        let mut entries = self.entries.write().unwrap();
        let (added, removed) = (undo.added.len(), undo.removed.len());
        for outpoint in &undo.added {
            entries.remove(outpoint);
        }
        for (outpoint, output, source_height, is_coinbase) in undo.removed {
            entries.insert(outpoint, UtxoEntry { output, source_height, is_coinbase });
        }
        debug!("utxo: rolled back block apply - {added} created outputs dropped, {removed} spent outputs restored");
    }

    /// A cheap immutable overlay over this set for validating a batch of
    /// transactions (a candidate block, or a mempool admission) without
    /// mutating the set itself.
    pub fn snapshot_view(&self) -> LayeredUtxoView {
        LayeredUtxoView::new(self)
    }

    #[cfg(test)]
    pub fn insert_for_test(&mut self, outpoint: OutPoint, output: TxOutput, height: u64, is_coinbase: bool) {
        self.entries.write().unwrap().insert(outpoint, UtxoEntry { output, source_height: height, is_coinbase });
    }

    /// Snapshots the entire set as a flat, serializable list, for persistence
    /// (the set itself holds its entries behind a lock and is neither `Clone`
    /// nor `Serialize`).
    pub fn export(&self) -> Vec<UtxoRecord> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(outpoint, entry)| UtxoRecord {
                outpoint: *outpoint,
                output: entry.output.clone(),
                source_height: entry.source_height,
                is_coinbase: entry.is_coinbase,
            })
            .collect()
    }

    /// Rebuilds a set from a snapshot produced by `export`, discarding any
    /// entries currently held.
    pub fn import(records: Vec<UtxoRecord>) -> Self {
        let mut entries = HashMap::with_capacity(records.len());
        for record in records {
            entries.insert(
                record.outpoint,
                UtxoEntry { output: record.output, source_height: record.source_height, is_coinbase: record.is_coinbase },
            );
        }
        UTXOSet { entries: RwLock::new(entries) }
    }
}

/// One entry of a `UTXOSet::export` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UtxoRecord {
    pub outpoint: OutPoint,
    pub output: TxOutput,
    pub source_height: u64,
    pub is_coinbase: bool,
}

impl Default for UTXOSet {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoView for UTXOSet {
    fn get(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.entries.read().unwrap().get(outpoint).map(|e| e.output.clone())
    }

    fn source_height(&self, outpoint: &OutPoint) -> Option<u64> {
        self.entries.read().unwrap().get(outpoint).map(|e| e.source_height)
    }

    fn is_coinbase(&self, outpoint: &OutPoint) -> bool {
        self.entries.read().unwrap().get(outpoint).map(|e| e.is_coinbase).unwrap_or(false)
    }

    fn is_spent(&self, _outpoint: &OutPoint) -> bool {
        // The base set only ever contains unspent outputs; a spent output
        // is simply absent, surfacing as `get` returning `None`.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockHeader};
    use crate::transaction::{Transaction, TxInput};
    use emberchain_crypto::generate_keypair;

    fn coinbase_tx(reward: u64, address: &emberchain_crypto::Address) -> Transaction {
        Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: reward, script_pubkey: address.to_base58check() }],
            locktime: 0,
        }
    }

    fn header_stub() -> BlockHeader {
        BlockHeader { version: 1, prev_hash: [0u8; 32], merkle_root: [0u8; 32], timestamp: 0, bits: 0x1d00ffff, nonce: 0 }
    }

    #[test]
    fn apply_block_then_rollback_restores_state() {
        let (_, _, addr) = generate_keypair();
        let set = UTXOSet::new();
        let block =
            Block { header: header_stub(), height: 1, transactions: vec![coinbase_tx(5_000_000_000, &addr)] };

        let undo = set.apply_block(&block).unwrap();
        assert_eq!(set.len(), 1);

        set.rollback(undo);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn apply_block_rejects_missing_input() {
        let (_, pk, addr) = generate_keypair();
        let set = UTXOSet::new();
        let spending_tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput {
                prev: OutPoint::new([0xaa; 32], 0),
                signature: vec![],
                pubkey: pk.serialize().to_vec(),
                sequence: 0,
            }],
            outputs: vec![TxOutput { amount: 100, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        let block = Block {
            header: header_stub(),
            height: 1,
            transactions: vec![coinbase_tx(5_000_000_000, &addr), spending_tx],
        };

        let err = set.apply_block(&block).unwrap_err();
        assert!(matches!(err, ApplyError::MissingInput(_)));
        assert_eq!(set.len(), 0, "a failed apply must not leave partial state");
    }

    #[test]
    fn layered_view_sees_overlay_before_base() {
        let (_, _, addr) = generate_keypair();
        let base = UTXOSet::new();
        let mut view = base.snapshot_view();

        let outpoint = OutPoint::new([1u8; 32], 0);
        let output = TxOutput { amount: 42, script_pubkey: addr.to_base58check() };
        view.add_output(outpoint, output.clone(), 10, false);

        assert_eq!(view.get(&outpoint), Some(output));
        view.mark_spent(outpoint);
        assert_eq!(view.get(&outpoint), None);
        assert!(view.is_spent(&outpoint));
    }
}
