//! Candidate block assembly and CPU mining.
//!
//! A miner repeatedly: takes the highest fee-rate transactions the mempool
//! will hand it, builds a coinbase paying itself the subsidy plus their
//! fees, and brute-forces a header nonce until `hash256(header)` meets the
//! current target. Found blocks are handed to a caller-supplied callback
//! rather than applied directly here, so the caller decides how to persist
//! and broadcast them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

use emberchain_consensus::{difficulty::get_target_from_bits, Blockchain, ConsensusError};
use emberchain_core::consts::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use emberchain_core::{merkle_root, BlockHeader, Transaction, TxOutput};
use emberchain_crypto::Address;
use emberchain_mempool::Mempool;

pub mod cpu;

pub use cpu::CpuMiner;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("mined block rejected by consensus: {0}")]
    Consensus(#[from] ConsensusError),
}

/// How often (in nonces tried) each worker thread checks whether the chain
/// tip moved out from under it and the current candidate is stale.
pub const TIP_CHECK_INTERVAL: u64 = 1 << 16;

/// Mining throughput and outcome counters, read by the RPC `mine` method.
#[derive(Debug, Default)]
pub struct MiningStats {
    pub hashes_tried: AtomicU64,
    pub blocks_found: AtomicU64,
}

impl MiningStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (self.hashes_tried.load(Ordering::Relaxed), self.blocks_found.load(Ordering::Relaxed))
    }
}

/// A fully-assembled, not-yet-mined block body: everything but the nonce.
pub struct Candidate {
    pub header: BlockHeader,
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

/// Builds a candidate extending `blockchain`'s current tip: selects
/// transactions from `mempool` by fee rate, pays their fees plus the
/// subsidy to `reward_address` in the coinbase, and leaves the header's
/// nonce at zero for the caller to search.
pub fn build_candidate(blockchain: &Blockchain, mempool: &Mempool, reward_address: &Address) -> Candidate {
    let height = blockchain.height() + 1;
    let bits = blockchain.next_required_bits();
    let tip_timestamp = blockchain.tip_header().timestamp;

    // Coinbase reserves roughly its own size up front so selection doesn't
    // overshoot the block size limit once it's prepended.
    let selected = mempool.select_for_block(MAX_BLOCK_SIZE.saturating_sub(256), MAX_BLOCK_SIGOPS);
    let fees: u64 = selected.iter().filter_map(|tx| mempool.get(&tx.txid())).map(|entry| entry.fee).sum();
    let subsidy = emberchain_core::consts::subsidy(height);

    let coinbase = Transaction {
        version: 1,
        chain_id: blockchain.params().chain_id,
        inputs: Vec::new(),
        outputs: vec![TxOutput { amount: subsidy.saturating_add(fees), script_pubkey: reward_address.to_base58check() }],
        // Commits the coinbase to its height so two blocks at different
        // heights never produce the same txid (no extranonce field exists
        // on a plain pay-to-address output to carry that uniqueness instead).
        locktime: height as u32,
    };

    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selected);

    let txids: Vec<_> = transactions.iter().map(|tx| tx.txid()).collect();
    let header = BlockHeader {
        version: 1,
        prev_hash: blockchain.tip_hash(),
        merkle_root: merkle_root(&txids),
        timestamp: emberchain_core::current_timestamp().max(tip_timestamp + 1),
        bits,
        nonce: 0,
    };

    Candidate { header, height, transactions }
}

/// Searches `candidate`'s nonce space across `threads` rayon workers,
/// checking `still_current` every `TIP_CHECK_INTERVAL` tries so a stale
/// candidate (the tip moved) can be abandoned quickly.
pub fn search_for_solution(candidate: &Candidate, threads: usize, stats: &MiningStats, still_current: &AtomicBool) -> Option<BlockHeader> {
    use rayon::prelude::*;

    let target = get_target_from_bits(candidate.header.bits);
    let threads = threads.max(1);
    let span = u64::MAX / threads as u64;

    (0..threads).into_par_iter().find_map_any(|worker| {
        let start = worker as u64 * span;
        let end = if worker == threads - 1 { u64::MAX } else { start.saturating_add(span) };

        let mut header = candidate.header.clone();
        let mut nonce = start;
        while nonce < end {
            header.nonce = nonce;
            if emberchain_consensus::difficulty::hash_meets_target(&header.hash(), &target) {
                return Some(header);
            }
            nonce += 1;
            if nonce % TIP_CHECK_INTERVAL == 0 {
                stats.hashes_tried.fetch_add(TIP_CHECK_INTERVAL, Ordering::Relaxed);
                if !still_current.load(Ordering::Relaxed) {
                    return None;
                }
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberchain_consensus::{ConsensusParams, Blockchain};
    use emberchain_core::Block;

    fn regtest_genesis(params: &ConsensusParams) -> Block {
        let reward_address = Address::from_hash160([0u8; 20]);
        let coinbase = Transaction {
            version: 1,
            chain_id: params.chain_id,
            inputs: Vec::new(),
            outputs: vec![TxOutput { amount: emberchain_core::consts::subsidy(0), script_pubkey: reward_address.to_base58check() }],
            locktime: 0,
        };
        let mut header = BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: merkle_root(&[coinbase.txid()]),
            timestamp: emberchain_core::consts::GENESIS_TIMESTAMP,
            bits: params.genesis_bits,
            nonce: 0,
        };
        let target = get_target_from_bits(header.bits);
        while !emberchain_consensus::difficulty::hash_meets_target(&header.hash(), &target) {
            header.nonce += 1;
        }
        Block { header, height: 0, transactions: vec![coinbase] }
    }

    #[test]
    fn build_candidate_pays_subsidy_to_reward_address() {
        let params = ConsensusParams::regtest();
        let genesis = regtest_genesis(&params);
        let blockchain = Blockchain::new(params, genesis).unwrap();
        let mempool = Mempool::new();
        let (_, _, address) = emberchain_crypto::generate_keypair();

        let candidate = build_candidate(&blockchain, &mempool, &address);
        assert_eq!(candidate.height, 1);
        assert_eq!(candidate.transactions.len(), 1);
        assert_eq!(candidate.transactions[0].outputs[0].script_pubkey, address.to_base58check());
    }

    #[test]
    fn search_for_solution_finds_a_header_meeting_the_target() {
        let params = ConsensusParams::regtest();
        let genesis = regtest_genesis(&params);
        let blockchain = Blockchain::new(params, genesis).unwrap();
        let mempool = Mempool::new();
        let (_, _, address) = emberchain_crypto::generate_keypair();

        let candidate = build_candidate(&blockchain, &mempool, &address);
        let stats = MiningStats::default();
        let still_current = std::sync::atomic::AtomicBool::new(true);
        let header = search_for_solution(&candidate, 1, &stats, &still_current).expect("regtest target is trivial");
        let target = get_target_from_bits(header.bits);
        assert!(emberchain_consensus::difficulty::hash_meets_target(&header.hash(), &target));
    }
}
