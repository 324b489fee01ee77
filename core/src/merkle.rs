//! Merkle root computation over transaction ids.

use emberchain_crypto::hash256;

use crate::Hash;

/// Computes the Merkle root of a sequence of transaction ids.
///
/// An empty list roots to the zero hash. A single txid roots to itself.
/// Odd levels duplicate the last hash, matching the well-known Bitcoin
/// convention (including its accepted same-txid-pair weakness).
pub fn merkle_root(txids: &[Hash]) -> Hash {
    if txids.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<Hash> = txids.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                hash256(&buf)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_roots_to_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn single_txid_roots_to_itself() {
        let txid = [7u8; 32];
        assert_eq!(merkle_root(&[txid]), txid);
    }

    #[test]
    fn odd_count_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let with_dup = merkle_root(&[a, b, c, c]);
        let odd = merkle_root(&[a, b, c]);
        assert_eq!(with_dup, odd);
    }

    #[test]
    fn order_matters() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
