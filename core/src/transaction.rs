//! The transaction model: inputs, outputs, and canonical (de)serialization.

use emberchain_crypto::{hash256, Address};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use thiserror::Error;

use crate::codec::{self, Cursor};
use crate::consts::MAX_MONEY;
use crate::utxo::UtxoView;
use crate::Hash;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("output amount out of range")]
    AmountOutOfRange,
    #[error("total output value exceeds max money")]
    TotalExceedsMaxMoney,
    #[error("chain id {got} does not match node chain id {want}")]
    ChainIdMismatch { got: u32, want: u32 },
    #[error("transaction exceeds maximum size")]
    TooLarge,
    #[error("coinbase transaction validated outside of block context")]
    CoinbaseOutsideBlock,
    #[error("referenced input {0:?} does not exist")]
    InputMissing(OutPoint),
    #[error("referenced input {0:?} is already spent")]
    DoubleSpend(OutPoint),
    #[error("coinbase output spent before maturity")]
    ImmatureCoinbase,
    #[error("invalid public key in input")]
    BadPublicKey,
    #[error("input pubkey does not match referenced output's address")]
    AddressMismatch,
    #[error("signature verification failed")]
    BadSignature,
    #[error("sum of inputs is less than sum of outputs")]
    NegativeFee,
}

/// A reference to a specific output of a specific transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }
}

impl codec::Encode for OutPoint {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.txid);
        codec::write_u32(out, self.vout);
    }
}

impl codec::Decode for OutPoint {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let txid = cursor.read_array::<32>()?;
        let vout = cursor.read_u32()?;
        Ok(OutPoint { txid, vout })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxInput {
    pub prev: OutPoint,
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// Encodes the fields covered by the sighash: `prev` and `sequence`, but
    /// not the signature itself (so signing can't be malleated into a
    /// different txid).
    fn encode_sighash(&self, out: &mut Vec<u8>) {
        self.prev.encode(out);
        codec::write_u32(out, self.sequence);
    }

    fn encode_full(&self, out: &mut Vec<u8>) {
        self.prev.encode(out);
        codec::write_bytes(out, &self.signature);
        codec::write_bytes(out, &self.pubkey);
        codec::write_u32(out, self.sequence);
    }

    fn decode_full(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let prev = OutPoint::decode(cursor)?;
        let signature = cursor.read_bytes()?;
        let pubkey = cursor.read_bytes()?;
        let sequence = cursor.read_u32()?;
        Ok(TxInput { prev, signature, pubkey, sequence })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    pub script_pubkey: String,
}

impl codec::Encode for TxOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_u64(out, self.amount);
        codec::write_string(out, &self.script_pubkey);
    }
}

impl codec::Decode for TxOutput {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let amount = cursor.read_u64()?;
        let script_pubkey = cursor.read_string()?;
        Ok(TxOutput { amount, script_pubkey })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub chain_id: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Serializes the sighash form for the given input index: all inputs'
    /// `prev`/`sequence` (never their signatures), plus all outputs.
    fn sighash_bytes(&self, input_index: usize) -> Vec<u8> {
        let mut out = Vec::new();
        codec::write_u32(&mut out, self.version);
        codec::write_u32(&mut out, self.chain_id);
        codec::write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_sighash(&mut out);
        }
        codec::write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(&mut out);
        }
        codec::write_u32(&mut out, self.locktime);
        // Binds the sighash to a specific input without including its own signature.
        codec::write_u32(&mut out, input_index as u32);
        out
    }

    pub fn sighash(&self, input_index: usize) -> Hash {
        hash256(&self.sighash_bytes(input_index))
    }

    /// The transaction id: hash256 of the canonical full serialization with
    /// input signatures blanked out, so malleating a signature cannot change
    /// the txid.
    pub fn txid(&self) -> Hash {
        let mut out = Vec::new();
        codec::write_u32(&mut out, self.version);
        codec::write_u32(&mut out, self.chain_id);
        codec::write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_sighash(&mut out);
        }
        codec::write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(&mut out);
        }
        codec::write_u32(&mut out, self.locktime);
        hash256(&out)
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Signs a single input in place given the signing key, setting both
    /// `signature` and `pubkey`.
    pub fn sign_input(
        &mut self,
        input_index: usize,
        secret_key: &secp256k1::SecretKey,
        public_key: &PublicKey,
    ) -> Result<(), emberchain_crypto::CryptoError> {
        let sighash = self.sighash(input_index);
        let signature = emberchain_crypto::sign(secret_key, &sighash)?;
        self.inputs[input_index].signature = signature;
        self.inputs[input_index].pubkey = public_key.serialize().to_vec();
        Ok(())
    }
}

impl codec::Encode for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_u32(out, self.version);
        codec::write_u32(out, self.chain_id);
        codec::write_varint(out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_full(out);
        }
        codec::write_varint(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(out);
        }
        codec::write_u32(out, self.locktime);
    }
}

impl codec::Decode for Transaction {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let version = cursor.read_u32()?;
        let chain_id = cursor.read_u32()?;
        let n_inputs = cursor.read_varint()?;
        let mut inputs = Vec::with_capacity(n_inputs as usize);
        for _ in 0..n_inputs {
            inputs.push(TxInput::decode_full(cursor)?);
        }
        let n_outputs = cursor.read_varint()?;
        let mut outputs = Vec::with_capacity(n_outputs as usize);
        for _ in 0..n_outputs {
            outputs.push(TxOutput::decode(cursor)?);
        }
        let locktime = cursor.read_u32()?;
        Ok(Transaction { version, chain_id, inputs, outputs, locktime })
    }
}

/// Structural checks that apply regardless of UTXO state: shape and size,
/// independent of mempool/chain context.
fn validate_structure(tx: &Transaction, node_chain_id: u32, max_tx_size: usize) -> Result<(), TxError> {
    if tx.outputs.is_empty() {
        return Err(TxError::NoOutputs);
    }
    let mut total: u64 = 0;
    for output in &tx.outputs {
        if output.amount > MAX_MONEY {
            return Err(TxError::AmountOutOfRange);
        }
        total = total
            .checked_add(output.amount)
            .ok_or(TxError::TotalExceedsMaxMoney)?;
    }
    if total > MAX_MONEY {
        return Err(TxError::TotalExceedsMaxMoney);
    }
    if tx.chain_id != node_chain_id {
        return Err(TxError::ChainIdMismatch { got: tx.chain_id, want: node_chain_id });
    }
    if codec::encode_to_vec(tx).len() > max_tx_size {
        return Err(TxError::TooLarge);
    }
    Ok(())
}

/// Full validation of a non-coinbase transaction against a UTXO view, per
/// the structural / lookup / maturity / signature / conservation checks.
/// Returns the fee (`sum(inputs) - sum(outputs)`) on success.
///
/// `current_height` is the height at which `tx` would be confirmed (used for
/// coinbase maturity checks against `view.source_height`).
pub fn validate_transaction(
    tx: &Transaction,
    view: &dyn UtxoView,
    node_chain_id: u32,
    max_tx_size: usize,
    current_height: u64,
    coinbase_maturity: u64,
) -> Result<u64, TxError> {
    validate_structure(tx, node_chain_id, max_tx_size)?;

    if tx.is_coinbase() {
        return Err(TxError::CoinbaseOutsideBlock);
    }

    let mut total_input: u64 = 0;
    for (index, input) in tx.inputs.iter().enumerate() {
        if view.is_spent(&input.prev) {
            return Err(TxError::DoubleSpend(input.prev));
        }
        let output = view.get(&input.prev).ok_or(TxError::InputMissing(input.prev))?;

        if view.is_coinbase(&input.prev) {
            let source_height = view.source_height(&input.prev).unwrap_or(current_height);
            if current_height.saturating_sub(source_height) < coinbase_maturity {
                return Err(TxError::ImmatureCoinbase);
            }
        }

        let public_key = PublicKey::from_slice(&input.pubkey).map_err(|_| TxError::BadPublicKey)?;
        let address = Address::from_pubkey(&public_key);
        let expected = Address::from_base58check(&output.script_pubkey).map_err(|_| TxError::AddressMismatch)?;
        if address != expected {
            return Err(TxError::AddressMismatch);
        }

        let sighash = tx.sighash(index);
        let sig = Signature::from_der(&input.signature).map_err(|_| TxError::BadSignature)?;
        verify_low_s(&public_key, &sighash, &sig).map_err(|_| TxError::BadSignature)?;

        total_input = total_input.checked_add(output.amount).ok_or(TxError::TotalExceedsMaxMoney)?;
    }

    let total_output = tx.total_output_value();
    if total_input < total_output {
        return Err(TxError::NegativeFee);
    }

    Ok(total_input - total_output)
}

fn verify_low_s(public_key: &PublicKey, sighash: &Hash, sig: &Signature) -> Result<(), ()> {
    let mut sig = *sig;
    if sig.normalize_s() {
        return Err(());
    }
    let secp = Secp256k1::verification_only();
    let message = Message::from_slice(sighash).map_err(|_| ())?;
    secp.verify_ecdsa(&message, &sig, public_key).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::UTXOSet;
    use emberchain_crypto::generate_keypair;

    fn create_test_output(amount: u64, address: &Address) -> TxOutput {
        TxOutput { amount, script_pubkey: address.to_base58check() }
    }

    fn create_funded_utxo(output: TxOutput, height: u64, coinbase: bool) -> (UTXOSet, OutPoint) {
        let mut set = UTXOSet::new();
        let outpoint = OutPoint::new([9u8; 32], 0);
        set.insert_for_test(outpoint, output, height, coinbase);
        (set, outpoint)
    }

    #[test]
    fn txid_excludes_signature_bytes() {
        let (_, pk, addr) = generate_keypair();
        let mut tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput {
                prev: OutPoint::new([1u8; 32], 0),
                signature: vec![],
                pubkey: pk.serialize().to_vec(),
                sequence: 0,
            }],
            outputs: vec![create_test_output(100, &addr)],
            locktime: 0,
        };
        let before = tx.txid();
        tx.inputs[0].signature = vec![1, 2, 3, 4];
        let after = tx.txid();
        assert_eq!(before, after);
    }

    #[test]
    fn roundtrip_encode_decode() {
        let (_, pk, addr) = generate_keypair();
        let tx = Transaction {
            version: 1,
            chain_id: 7,
            inputs: vec![TxInput {
                prev: OutPoint::new([3u8; 32], 2),
                signature: vec![0xde, 0xad],
                pubkey: pk.serialize().to_vec(),
                sequence: 0xffff_ffff,
            }],
            outputs: vec![create_test_output(555, &addr)],
            locktime: 99,
        };
        let bytes = codec::encode_to_vec(&tx);
        let decoded: Transaction = codec::decode_from_slice(&bytes).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn validate_transaction_accepts_well_signed_spend() {
        let (sk, pk, addr) = generate_keypair();
        let (_, _, addr_b) = generate_keypair();
        let output = create_test_output(1000, &addr);
        let (set, outpoint) = create_funded_utxo(output, 0, false);

        let mut tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput { prev: outpoint, signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![create_test_output(900, &addr_b)],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();

        let fee = validate_transaction(&tx, &set, 1, 100_000, 1, 100).unwrap();
        assert_eq!(fee, 100);
    }

    #[test]
    fn validate_transaction_rejects_chain_id_mismatch() {
        let (sk, pk, addr) = generate_keypair();
        let output = create_test_output(1000, &addr);
        let (set, outpoint) = create_funded_utxo(output, 0, false);

        let mut tx = Transaction {
            version: 1,
            chain_id: 2,
            inputs: vec![TxInput { prev: outpoint, signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![create_test_output(900, &addr)],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();

        let err = validate_transaction(&tx, &set, 1, 100_000, 1, 100).unwrap_err();
        assert_eq!(err, TxError::ChainIdMismatch { got: 2, want: 1 });
    }

    #[test]
    fn validate_transaction_rejects_immature_coinbase() {
        let (sk, pk, addr) = generate_keypair();
        let output = create_test_output(1000, &addr);
        let (set, outpoint) = create_funded_utxo(output, 0, true);

        let mut tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput { prev: outpoint, signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![create_test_output(900, &addr)],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();

        let err = validate_transaction(&tx, &set, 1, 100_000, 99, 100).unwrap_err();
        assert_eq!(err, TxError::ImmatureCoinbase);

        let ok = validate_transaction(&tx, &set, 1, 100_000, 100, 100);
        assert!(ok.is_ok());
    }

    #[test]
    fn validate_transaction_rejects_tampered_signature() {
        let (sk, pk, addr) = generate_keypair();
        let output = create_test_output(1000, &addr);
        let (set, outpoint) = create_funded_utxo(output, 0, false);

        let mut tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput { prev: outpoint, signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![create_test_output(900, &addr)],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();
        let last = tx.inputs[0].signature.len() - 1;
        tx.inputs[0].signature[last] ^= 0xff;

        let err = validate_transaction(&tx, &set, 1, 100_000, 1, 100).unwrap_err();
        assert_eq!(err, TxError::BadSignature);
    }

    #[test]
    fn validate_transaction_rejects_negative_fee() {
        let (sk, pk, addr) = generate_keypair();
        let output = create_test_output(1000, &addr);
        let (set, outpoint) = create_funded_utxo(output, 0, false);

        let mut tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![TxInput { prev: outpoint, signature: vec![], pubkey: pk.serialize().to_vec(), sequence: 0 }],
            outputs: vec![create_test_output(1500, &addr)],
            locktime: 0,
        };
        tx.sign_input(0, &sk, &pk).unwrap();

        let err = validate_transaction(&tx, &set, 1, 100_000, 1, 100).unwrap_err();
        assert_eq!(err, TxError::NegativeFee);
    }

    #[test]
    fn coinbase_rejected_outside_block_context() {
        let (_, _, addr) = generate_keypair();
        let tx = Transaction {
            version: 1,
            chain_id: 1,
            inputs: vec![],
            outputs: vec![create_test_output(5_000_000_000, &addr)],
            locktime: 0,
        };
        let set = UTXOSet::new();
        let err = validate_transaction(&tx, &set, 1, 100_000, 1, 100).unwrap_err();
        assert_eq!(err, TxError::CoinbaseOutsideBlock);
    }
}
