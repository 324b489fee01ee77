//! The block model: header, canonical encoding, and header hashing.
//!
//! Structural and contextual validation (coinbase placement, transaction
//! acceptance, proof-of-work, difficulty retargeting) lives in the
//! `consensus` crate's `Blockchain::accept_block`; this module only
//! provides the data shape and the primitives (`header_hash`,
//! `merkle_root_matches`) that validation builds on.

use emberchain_crypto::hash256;

use crate::codec::{self, Cursor};
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use crate::Hash;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
}

impl codec::Encode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_u32(out, self.version);
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.merkle_root);
        codec::write_u64(out, self.timestamp);
        codec::write_u32(out, self.bits);
        codec::write_u64(out, self.nonce);
    }
}

impl codec::Decode for BlockHeader {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let version = cursor.read_u32()?;
        let prev_hash = cursor.read_array::<32>()?;
        let merkle_root = cursor.read_array::<32>()?;
        let timestamp = cursor.read_u64()?;
        let bits = cursor.read_u32()?;
        let nonce = cursor.read_u64()?;
        Ok(BlockHeader { version, prev_hash, merkle_root, timestamp, bits, nonce })
    }
}

impl BlockHeader {
    /// The block hash: double-SHA-256 of the header's canonical encoding.
    pub fn hash(&self) -> Hash {
        hash256(&codec::encode_to_vec(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn computed_merkle_root(&self) -> Hash {
        let txids: Vec<Hash> = self.transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root(&txids)
    }

    pub fn merkle_root_matches(&self) -> bool {
        self.header.merkle_root == self.computed_merkle_root()
    }

    pub fn has_exactly_one_coinbase(&self) -> bool {
        !self.transactions.is_empty()
            && self.transactions[0].is_coinbase()
            && self.transactions[1..].iter().all(|tx| !tx.is_coinbase())
    }

    pub fn serialized_size(&self) -> usize {
        codec::encode_to_vec(self).len()
    }
}

impl codec::Encode for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        codec::write_u64(out, self.height);
        codec::write_varint(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(out);
        }
    }
}

impl codec::Decode for Block {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let header = BlockHeader::decode(cursor)?;
        let height = cursor.read_u64()?;
        let n_tx = cursor.read_varint()?;
        let mut transactions = Vec::with_capacity(n_tx as usize);
        for _ in 0..n_tx {
            transactions.push(Transaction::decode(cursor)?);
        }
        Ok(Block { header, height, transactions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxOutput;
    use emberchain_crypto::generate_keypair;

    fn create_test_header() -> BlockHeader {
        BlockHeader { version: 1, prev_hash: [0u8; 32], merkle_root: [0u8; 32], timestamp: 1_000_000_000, bits: 0x1d00ffff, nonce: 0 }
    }

    fn create_test_coinbase() -> Transaction {
        let (_, _, addr) = generate_keypair();
        Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![TxOutput { amount: 5_000_000_000, script_pubkey: addr.to_base58check() }],
            locktime: 0,
        }
    }

    #[test]
    fn roundtrip_encode_decode() {
        let block = Block { header: create_test_header(), height: 1, transactions: vec![create_test_coinbase()] };
        let bytes = codec::encode_to_vec(&block);
        let decoded: Block = codec::decode_from_slice(&bytes).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn merkle_root_matches_computed_root() {
        let coinbase = create_test_coinbase();
        let mut header = create_test_header();
        header.merkle_root = merkle_root(&[coinbase.txid()]);
        let block = Block { header, height: 1, transactions: vec![coinbase] };
        assert!(block.merkle_root_matches());
    }

    #[test]
    fn merkle_root_mismatch_detected() {
        let block = Block { header: create_test_header(), height: 1, transactions: vec![create_test_coinbase()] };
        assert!(!block.merkle_root_matches());
    }

    #[test]
    fn exactly_one_coinbase_required() {
        let coinbase = create_test_coinbase();
        let second_coinbase = create_test_coinbase();
        let block = Block {
            header: create_test_header(),
            height: 1,
            transactions: vec![coinbase, second_coinbase],
        };
        assert!(!block.has_exactly_one_coinbase());
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let mut header = create_test_header();
        let h1 = header.hash();
        header.nonce = 1;
        let h2 = header.hash();
        assert_ne!(h1, h2);
    }
}
