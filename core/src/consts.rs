//! Protocol-wide constants shared by every crate in the workspace.

/// Maximum representable supply, in base units (21,000,000 coins * 10^8).
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Base units per whole coin.
pub const COIN: u64 = 100_000_000;

/// Blocks between each halving of the block subsidy.
pub const HALVING_INTERVAL: u64 = 210_000;

/// Blocks between each difficulty retarget.
pub const RETARGET_INTERVAL: u64 = 2016;

/// Target time between blocks, in seconds.
pub const TARGET_BLOCK_TIME: u64 = 600;

/// Confirmations required before a coinbase output may be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Maximum serialized block size, in bytes.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum number of signature operations per block.
pub const MAX_BLOCK_SIGOPS: usize = 20_000;

/// Maximum serialized transaction size, in bytes.
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum total size of the mempool, in bytes.
pub const MAX_MEMPOOL_BYTES: usize = 300_000_000;

/// Minimum relay fee rate, in base units per kilobyte.
pub const MIN_RELAY_FEE: u64 = 1000;

/// Mempool entry expiry, in seconds (14 days).
pub const MEMPOOL_EXPIRY_SECS: u64 = 14 * 24 * 60 * 60;

/// Default P2P listen port.
pub const P2P_PORT: u16 = 8333;

/// Maximum P2P message payload size, in bytes (32 MiB).
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Maximum inventory items returned in a single batch during sync.
pub const MAX_INV_BATCH: usize = 500;

/// Genesis block constants.
pub const GENESIS_TIMESTAMP: u64 = 1_000_000_000;
pub const GENESIS_BITS: u32 = 0x1d00ffff;

/// Computes the block subsidy at the given height: `50 >> (height / HALVING_INTERVAL)`,
/// zero once shifted beyond 63 bits.
pub fn subsidy(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_halves_on_schedule() {
        assert_eq!(subsidy(0), 50 * COIN);
        assert_eq!(subsidy(HALVING_INTERVAL - 1), 50 * COIN);
        assert_eq!(subsidy(HALVING_INTERVAL), 25 * COIN);
        assert_eq!(subsidy(HALVING_INTERVAL * 2), 12 * COIN + 50_000_000);
    }

    #[test]
    fn subsidy_reaches_zero() {
        assert_eq!(subsidy(HALVING_INTERVAL * 64), 0);
        assert_eq!(subsidy(HALVING_INTERVAL * 1000), 0);
    }
}
