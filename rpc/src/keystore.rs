//! A minimal in-memory signing-key store.
//!
//! Key-file encryption at rest and wallet management proper are out of
//! scope here; the RPC layer only needs something that yields a fresh
//! address and, later, the keypair behind it to sign a spend. Nothing is
//! persisted — restarting the node forgets every key `new_wallet` handed
//! out.

use std::collections::HashMap;

use secp256k1::{PublicKey, SecretKey};
use tokio::sync::RwLock;

use emberchain_crypto::Address;

#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<Address, (SecretKey, PublicKey)>>,
}

impl KeyStore {
    pub fn new() -> Self {
        KeyStore { keys: RwLock::new(HashMap::new()) }
    }

    /// Generates a fresh keypair, retains it under its derived address, and
    /// returns that address.
    pub async fn generate(&self) -> Address {
        let (secret_key, public_key, address) = emberchain_crypto::generate_keypair();
        self.keys.write().await.insert(address, (secret_key, public_key));
        address
    }

    pub async fn get(&self, address: &Address) -> Option<(SecretKey, PublicKey)> {
        self.keys.read().await.get(address).copied()
    }
}
