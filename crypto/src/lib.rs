//! Cryptographic primitives for Emberchain: hashing, address derivation,
//! and low-S-enforced ECDSA signing/verification over secp256k1.

use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Version byte prepended to the hash160 payload before base58check encoding.
pub const ADDRESS_VERSION: u8 = 0x00;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key format")]
    InvalidKey,
    #[error("invalid address encoding")]
    InvalidAddress,
    #[error("signing failed")]
    SigningError,
}

/// Double SHA-256, used for txids, block hashes, and sighashes.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let once: [u8; 32] = Sha256::digest(data).into();
    Sha256::digest(once).into()
}

/// RIPEMD-160(SHA-256(data)), the standard address hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha: [u8; 32] = Sha256::digest(data).into();
    Ripemd160::digest(sha).into()
}

/// A base58check-encoded address: `version_byte || hash160(pubkey)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_pubkey(pubkey: &PublicKey) -> Self {
        Address(hash160(&pubkey.serialize()))
    }

    pub fn from_hash160(hash: [u8; 20]) -> Self {
        Address(hash)
    }

    pub fn as_hash160(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_base58check(&self) -> String {
        bs58::encode(self.0)
            .with_check_version(ADDRESS_VERSION)
            .into_string()
    }

    pub fn from_base58check(s: &str) -> Result<Self, CryptoError> {
        let decoded = bs58::decode(s)
            .with_check(Some(ADDRESS_VERSION))
            .into_vec()
            .map_err(|_| CryptoError::InvalidAddress)?;

        // with_check returns the version byte followed by the payload.
        if decoded.len() != 21 {
            return Err(CryptoError::InvalidAddress);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&decoded[1..21]);
        Ok(Address(hash))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base58check())
    }
}

/// Generates a fresh secp256k1 keypair and its derived address.
pub fn generate_keypair() -> (SecretKey, PublicKey, Address) {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let (secret_key, public_key) = secp.generate_keypair(&mut rng);
    let address = Address::from_pubkey(&public_key);
    (secret_key, public_key, address)
}

/// Signs a 32-byte message hash, returning a DER-encoded, low-S-normalized signature.
pub fn sign(secret_key: &SecretKey, msg_hash: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_slice(msg_hash).map_err(|_| CryptoError::SigningError)?;
    let mut sig = secp.sign_ecdsa(&message, secret_key);
    sig.normalize_s();
    Ok(sig.serialize_der().to_vec())
}

/// Verifies a DER-encoded signature against a 32-byte message hash.
///
/// High-S signatures are rejected outright rather than normalized, per the
/// anti-malleability requirement: a signer must always submit the canonical
/// low-S form.
pub fn verify(public_key: &PublicKey, msg_hash: &[u8; 32], signature: &[u8]) -> Result<bool, CryptoError> {
    let secp = Secp256k1::verification_only();
    let message = Message::from_slice(msg_hash).map_err(|_| CryptoError::InvalidKey)?;

    let mut sig = match Signature::from_der(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };

    if sig.normalize_s() {
        // normalize_s() returned true: the signature was not already in
        // canonical low-S form.
        return Ok(false);
    }

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::constants::CURVE_ORDER;
    use secp256k1::ecdsa::Signature;

    fn sub_mod_order(s: &[u8; 32]) -> [u8; 32] {
        let mut result = [0u8; 32];
        let mut borrow: i32 = 0;
        for i in (0..32).rev() {
            let mut diff = CURVE_ORDER[i] as i32 - s[i] as i32 - borrow;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            result[i] = diff as u8;
        }
        result
    }

    #[test]
    fn address_base58check_roundtrip() {
        let (_, public_key, address) = generate_keypair();
        let _ = public_key;
        let encoded = address.to_base58check();
        let decoded = Address::from_base58check(&encoded).unwrap();
        assert_eq!(address, decoded);
    }

    #[test]
    fn address_rejects_bad_checksum() {
        let (_, _, address) = generate_keypair();
        let mut encoded = address.to_base58check();
        encoded.push('x');
        assert!(Address::from_base58check(&encoded).is_err());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let (secret_key, public_key, _) = generate_keypair();
        let msg_hash = hash256(b"emberchain test message");

        let signature = sign(&secret_key, &msg_hash).unwrap();
        assert!(verify(&public_key, &msg_hash, &signature).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let (secret_key, public_key, _) = generate_keypair();
        let msg_hash = hash256(b"emberchain test message");
        let other_hash = hash256(b"a different message");

        let signature = sign(&secret_key, &msg_hash).unwrap();
        assert!(!verify(&public_key, &other_hash, &signature).unwrap());
    }

    #[test]
    fn verify_rejects_high_s_signature() {
        let (secret_key, public_key, _) = generate_keypair();
        let msg_hash = hash256(b"low-s malleability test");

        let secp = Secp256k1::new();
        let message = Message::from_slice(&msg_hash).unwrap();
        let low_s_sig = secp.sign_ecdsa(&message, &secret_key);

        let compact = low_s_sig.serialize_compact();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&compact[..32]);
        s.copy_from_slice(&compact[32..]);

        let high_s = sub_mod_order(&s);
        let mut flipped = [0u8; 64];
        flipped[..32].copy_from_slice(&r);
        flipped[32..].copy_from_slice(&high_s);

        let high_s_sig = Signature::from_compact(&flipped).unwrap();
        let der = high_s_sig.serialize_der().to_vec();

        assert!(!verify(&public_key, &msg_hash, &der).unwrap());
    }

    #[test]
    fn hash256_is_double_sha256() {
        let once: [u8; 32] = Sha256::digest(b"abc").into();
        let twice: [u8; 32] = Sha256::digest(once).into();
        assert_eq!(hash256(b"abc"), twice);
    }
}
