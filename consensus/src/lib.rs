//! The consensus engine: difficulty retargeting and the `Blockchain` chain
//! state machine (block acceptance, UTXO application, header validation).

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use emberchain_core::consts::{
    COINBASE_MATURITY, MAX_BLOCK_SIZE, MAX_MONEY, MAX_TX_SIZE, RETARGET_INTERVAL, TARGET_BLOCK_TIME,
};
use emberchain_core::{
    consts, validate_transaction, ApplyError, Block, BlockHeader, Hash, LayeredUtxoView, Network, TxError, UTXOSet,
};

pub mod difficulty;

pub use difficulty::{bits_to_target, calculate_next_bits, get_bits_for_difficulty, get_target_from_bits, hash_meets_target};

const MAX_FUTURE_DRIFT_SECS: u64 = 2 * 60 * 60;
const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("block height {got} does not extend the current tip (expected {want})")]
    InvalidHeight { got: u64, want: u64 },
    #[error("block's prev_hash does not match the current tip")]
    InvalidPrevHash,
    #[error("block exceeds maximum size of {0} bytes")]
    BlockTooLarge(usize),
    #[error("block must contain exactly one coinbase transaction, in position 0")]
    BadCoinbaseStructure,
    #[error("block merkle root does not match its transactions")]
    BadMerkleRoot,
    #[error("block header hash does not satisfy its difficulty target")]
    BadPoW,
    #[error("block bits {got:#x} do not match the required value {want:#x}")]
    BadDifficultyBits { got: u32, want: u32 },
    #[error("block timestamp does not exceed the median of the last 11 blocks")]
    TimestampTooOld,
    #[error("block timestamp is too far in the future")]
    TimestampTooFarFuture,
    #[error("coinbase output total {got} exceeds subsidy + fees {want}")]
    CoinbaseValueTooHigh { got: u64, want: u64 },
    #[error("transaction {0:?} invalid: {1}")]
    TransactionInvalid(Hash, TxError),
    #[error("failed to apply block to the UTXO set: {0}")]
    Apply(#[from] ApplyError),
}

/// Per-network consensus parameters. Only `regtest` departs from the
/// compiled-in constants, trading a trivial minimum difficulty for fast
/// local block production.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsensusParams {
    pub network: Network,
    pub chain_id: u32,
    pub max_block_size: usize,
    pub max_tx_size: usize,
    pub coinbase_maturity: u64,
    pub genesis_bits: u32,
}

impl ConsensusParams {
    pub fn mainnet() -> Self {
        ConsensusParams {
            network: Network::Mainnet,
            chain_id: 1,
            max_block_size: MAX_BLOCK_SIZE,
            max_tx_size: MAX_TX_SIZE,
            coinbase_maturity: COINBASE_MATURITY,
            genesis_bits: consts::GENESIS_BITS,
        }
    }

    pub fn testnet() -> Self {
        ConsensusParams { network: Network::Testnet, chain_id: 2, ..Self::mainnet() }
    }

    pub fn regtest() -> Self {
        ConsensusParams {
            network: Network::Regtest,
            chain_id: 3,
            genesis_bits: 0x207fffff,
            coinbase_maturity: 1,
            ..Self::mainnet()
        }
    }
}

/// The chain state machine: an ordered sequence of accepted blocks plus the
/// UTXO set they produce. Extends a single branch only — a block whose
/// `prev_hash` does not match the current tip is rejected outright rather
/// than buffered as a candidate side branch (see DESIGN.md).
pub struct Blockchain {
    params: ConsensusParams,
    utxo_set: UTXOSet,
    chain: RwLock<Vec<Block>>,
    tx_index: RwLock<HashMap<Hash, (u64, usize)>>,
}

impl Blockchain {
    /// Builds a chain containing only `genesis`. The caller is responsible
    /// for constructing a genesis block consistent with `params`.
    pub fn new(params: ConsensusParams, genesis: Block) -> Result<Self, ConsensusError> {
        let chain = Blockchain {
            params,
            utxo_set: UTXOSet::new(),
            chain: RwLock::new(Vec::new()),
            tx_index: RwLock::new(HashMap::new()),
        };
        chain.utxo_set.apply_block(&genesis)?;
        chain.index_block(&genesis);
        chain.chain.write().unwrap().push(genesis);
        Ok(chain)
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn utxo_set(&self) -> &UTXOSet {
        &self.utxo_set
    }

    pub fn height(&self) -> u64 {
        self.chain.read().unwrap().last().map(|b| b.height).unwrap_or(0)
    }

    pub fn tip_hash(&self) -> Hash {
        self.chain.read().unwrap().last().map(|b| b.hash()).unwrap_or([0u8; 32])
    }

    pub fn tip_header(&self) -> BlockHeader {
        self.chain.read().unwrap().last().expect("chain always has a genesis block").header.clone()
    }

    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.chain.read().unwrap().get(height as usize).cloned()
    }

    pub fn tx_location(&self, txid: &Hash) -> Option<(u64, usize)> {
        self.tx_index.read().unwrap().get(txid).copied()
    }

    fn index_block(&self, block: &Block) {
        let mut index = self.tx_index.write().unwrap();
        for (tx_index_in_block, tx) in block.transactions.iter().enumerate() {
            index.insert(tx.txid(), (block.height, tx_index_in_block));
        }
    }

    /// The median timestamp of the last 11 accepted blocks (or all of them,
    /// if fewer), past which a new block's timestamp must fall.
    pub fn median_time_past(&self) -> u64 {
        let chain = self.chain.read().unwrap();
        let window = MEDIAN_TIME_SPAN.min(chain.len());
        let mut timestamps: Vec<u64> = chain[chain.len() - window..].iter().map(|b| b.header.timestamp).collect();
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }

    /// The difficulty bits required of the next block after the current tip.
    pub fn next_required_bits(&self) -> u32 {
        let chain = self.chain.read().unwrap();
        let tip = chain.last().expect("chain always has a genesis block");
        let next_height = tip.height + 1;

        if next_height % RETARGET_INTERVAL != 0 {
            return tip.header.bits;
        }

        let window_start_height = next_height - RETARGET_INTERVAL;
        let window_start = chain
            .get(window_start_height as usize)
            .map(|b| b.header.timestamp)
            .unwrap_or(tip.header.timestamp.saturating_sub(RETARGET_INTERVAL * TARGET_BLOCK_TIME));

        calculate_next_bits(tip.header.bits, window_start, tip.header.timestamp)
    }

    /// Validates and, on success, applies `block` as the new chain tip.
    pub fn accept_block(&self, block: Block) -> Result<(), ConsensusError> {
        let expected_height = self.height() + 1;
        if block.height != expected_height {
            return Err(ConsensusError::InvalidHeight { got: block.height, want: expected_height });
        }
        if block.header.prev_hash != self.tip_hash() {
            return Err(ConsensusError::InvalidPrevHash);
        }

        let size = block.serialized_size();
        if size > self.params.max_block_size {
            return Err(ConsensusError::BlockTooLarge(size));
        }
        if !block.has_exactly_one_coinbase() {
            return Err(ConsensusError::BadCoinbaseStructure);
        }
        if !block.merkle_root_matches() {
            return Err(ConsensusError::BadMerkleRoot);
        }

        if block.header.timestamp <= self.median_time_past() {
            return Err(ConsensusError::TimestampTooOld);
        }
        if block.header.timestamp > emberchain_core::current_timestamp() + MAX_FUTURE_DRIFT_SECS {
            return Err(ConsensusError::TimestampTooFarFuture);
        }

        let required_bits = self.next_required_bits();
        if block.header.bits != required_bits {
            return Err(ConsensusError::BadDifficultyBits { got: block.header.bits, want: required_bits });
        }
        let target = get_target_from_bits(block.header.bits);
        if !hash_meets_target(&block.hash(), &target) {
            return Err(ConsensusError::BadPoW);
        }

        let mut fees_total: u64 = 0;
        let mut overlay = LayeredUtxoView::new(&self.utxo_set);
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            if tx_index == 0 {
                continue;
            }
            let fee = validate_transaction(
                tx,
                &overlay,
                self.params.chain_id,
                self.params.max_tx_size,
                block.height,
                self.params.coinbase_maturity,
            )
            .map_err(|e| ConsensusError::TransactionInvalid(tx.txid(), e))?;
            fees_total = fees_total.saturating_add(fee);

            for input in &tx.inputs {
                overlay.mark_spent(input.prev);
            }
            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                overlay.add_output(
                    emberchain_core::OutPoint::new(txid, vout as u32),
                    output.clone(),
                    block.height,
                    false,
                );
            }
        }

        let coinbase_total: u64 = block.transactions[0].outputs.iter().map(|o| o.amount).sum();
        let subsidy = consts::subsidy(block.height);
        let allowed = subsidy.saturating_add(fees_total).min(MAX_MONEY);
        if coinbase_total > allowed {
            return Err(ConsensusError::CoinbaseValueTooHigh { got: coinbase_total, want: allowed });
        }

        self.utxo_set.apply_block(&block)?;
        self.index_block(&block);
        self.chain.write().unwrap().push(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberchain_core::merkle_root;
    use emberchain_core::{OutPoint, Transaction, TxInput, TxOutput};
    use emberchain_crypto::generate_keypair;

    fn genesis_block(bits: u32, address: &emberchain_crypto::Address) -> Block {
        let coinbase = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 50 * consts::COIN, script_pubkey: address.to_base58check() }],
            locktime: 0,
        };
        let txid = coinbase.txid();
        let header = BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: merkle_root(&[txid]),
            timestamp: consts::GENESIS_TIMESTAMP,
            bits,
            nonce: 0,
        };
        Block { header, height: 0, transactions: vec![coinbase] }
    }

    fn mine_trivial(mut header: BlockHeader) -> BlockHeader {
        let target = get_target_from_bits(header.bits);
        loop {
            if hash_meets_target(&header.hash(), &target) {
                return header;
            }
            header.nonce += 1;
        }
    }

    #[test]
    fn accept_genesis_then_one_block() {
        let (_, _, addr) = generate_keypair();
        let params = ConsensusParams::regtest();
        let mut genesis = genesis_block(params.genesis_bits, &addr);
        genesis.header = mine_trivial(genesis.header);

        let chain = Blockchain::new(params, genesis).unwrap();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.utxo_set().len(), 1);

        let coinbase = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 50 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        let txid = coinbase.txid();
        let header = BlockHeader {
            version: 1,
            prev_hash: chain.tip_hash(),
            merkle_root: merkle_root(&[txid]),
            timestamp: consts::GENESIS_TIMESTAMP + 1,
            bits: chain.next_required_bits(),
            nonce: 0,
        };
        let header = mine_trivial(header);
        let block = Block { header, height: 1, transactions: vec![coinbase] };

        chain.accept_block(block).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.utxo_set().len(), 2);
    }

    #[test]
    fn accept_block_rejects_bad_prev_hash() {
        let (_, _, addr) = generate_keypair();
        let params = ConsensusParams::regtest();
        let mut genesis = genesis_block(params.genesis_bits, &addr);
        genesis.header = mine_trivial(genesis.header);
        let chain = Blockchain::new(params, genesis).unwrap();

        let coinbase = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 50 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        let txid = coinbase.txid();
        let header = BlockHeader {
            version: 1,
            prev_hash: [0xff; 32],
            merkle_root: merkle_root(&[txid]),
            timestamp: consts::GENESIS_TIMESTAMP + 1,
            bits: chain.next_required_bits(),
            nonce: 0,
        };
        let header = mine_trivial(header);
        let block = Block { header, height: 1, transactions: vec![coinbase] };

        let err = chain.accept_block(block).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidPrevHash));
    }

    #[test]
    fn accept_block_rejects_bad_pow() {
        let (_, _, addr) = generate_keypair();
        let params = ConsensusParams::regtest();
        let mut genesis = genesis_block(params.genesis_bits, &addr);
        genesis.header = mine_trivial(genesis.header);
        let chain = Blockchain::new(params, genesis).unwrap();

        let coinbase = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 50 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        let txid = coinbase.txid();
        let header = BlockHeader {
            version: 1,
            prev_hash: chain.tip_hash(),
            merkle_root: merkle_root(&[txid]),
            timestamp: consts::GENESIS_TIMESTAMP + 1,
            bits: chain.next_required_bits(),
            nonce: 0,
        };
        let block = Block { header, height: 1, transactions: vec![coinbase] };

        let err = chain.accept_block(block).unwrap_err();
        assert!(matches!(err, ConsensusError::BadPoW));
    }

    #[test]
    fn accept_block_rejects_double_spend_across_transactions() {
        let (sk, pk, addr) = generate_keypair();
        let (_, _, addr_b) = generate_keypair();
        let params = ConsensusParams::regtest();
        let mut genesis = genesis_block(params.genesis_bits, &addr);
        genesis.header = mine_trivial(genesis.header);
        let chain = Blockchain::new(params, genesis.clone()).unwrap();

        let genesis_outpoint = OutPoint::new(genesis.transactions[0].txid(), 0);
        let mut spend_a = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput { prev: genesis_outpoint, signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![TxOutput { amount: 40 * consts::COIN, script_pubkey: addr_b.to_base58check() }],
            locktime: 0,
        };
        spend_a.sign_input(0, &sk, &pk).unwrap();
        let mut spend_b = spend_a.clone();
        spend_b.outputs[0].amount = 41 * consts::COIN;
        spend_b.sign_input(0, &sk, &pk).unwrap();

        let coinbase = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 50 * consts::COIN, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        };
        let txids: Vec<Hash> = vec![coinbase.txid(), spend_a.txid(), spend_b.txid()];
        let header = BlockHeader {
            version: 1,
            prev_hash: chain.tip_hash(),
            merkle_root: merkle_root(&txids),
            timestamp: consts::GENESIS_TIMESTAMP + 1,
            bits: chain.next_required_bits(),
            nonce: 0,
        };
        let header = mine_trivial(header);
        let block = Block { header, height: 1, transactions: vec![coinbase, spend_a, spend_b] };

        let err = chain.accept_block(block).unwrap_err();
        assert!(matches!(err, ConsensusError::TransactionInvalid(_, TxError::DoubleSpend(_))));
        assert_eq!(chain.height(), 0, "a rejected block must not advance the tip");
    }
}
