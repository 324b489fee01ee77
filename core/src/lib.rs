//! Core data types for Emberchain: the canonical codec, the transaction and
//! block model, and the UTXO set.

pub mod codec;
pub mod consts;
pub mod merkle;
pub mod block;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use codec::{CodecError, Decode, Encode};
pub use merkle::merkle_root;
pub use transaction::{validate_transaction, OutPoint, Transaction, TxError, TxInput, TxOutput};
pub use utxo::{ApplyError, LayeredUtxoView, Undo, UtxoRecord, UtxoView, UTXOSet};

use std::fmt;
use thiserror::Error;

/// A 32-byte double-SHA-256 digest: txids, block hashes, merkle roots.
pub type Hash = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "main"),
            Network::Testnet => write!(f, "test"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("crypto error: {0}")]
    Crypto(#[from] emberchain_crypto::CryptoError),
}

/// Current UNIX timestamp in seconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Renders a 32-byte hash as a hex string.
pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}
