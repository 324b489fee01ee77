//! Drives the build-candidate / search-for-solution loop on a dedicated
//! blocking task until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;

use emberchain_consensus::Blockchain;
use emberchain_core::Block;
use emberchain_crypto::Address;
use emberchain_mempool::Mempool;

use crate::{build_candidate, search_for_solution, MiningStats};

/// A background CPU miner. Dropping it, or calling `stop`, signals the
/// mining loop to give up its current candidate and exit at the next
/// opportunity; it does not block waiting for the loop to actually stop.
pub struct CpuMiner {
    running: Arc<AtomicBool>,
    stats: Arc<MiningStats>,
    handle: Option<JoinHandle<()>>,
}

impl CpuMiner {
    /// Spawns the mining loop. `on_block` is called (off the async runtime,
    /// from the blocking mining thread) for every block this miner finds
    /// and successfully applies to `blockchain` — the caller is responsible
    /// for persisting and broadcasting it.
    pub fn start(
        blockchain: Arc<Blockchain>,
        mempool: Arc<Mempool>,
        reward_address: Address,
        threads: usize,
        on_block: impl Fn(Block) + Send + Sync + 'static,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(MiningStats::default());

        let task_running = Arc::clone(&running);
        let task_stats = Arc::clone(&stats);
        let handle = tokio::task::spawn_blocking(move || {
            run_loop(blockchain, mempool, reward_address, threads, task_running, task_stats, on_block);
        });

        CpuMiner { running, stats, handle: Some(handle) }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Returns `(hashes_tried, blocks_found)`.
    pub fn stats(&self) -> (u64, u64) {
        self.stats.snapshot()
    }
}

impl Drop for CpuMiner {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn run_loop(
    blockchain: Arc<Blockchain>,
    mempool: Arc<Mempool>,
    reward_address: Address,
    threads: usize,
    running: Arc<AtomicBool>,
    stats: Arc<MiningStats>,
    on_block: impl Fn(Block) + Send + Sync,
) {
    info!("mining: starting CPU miner with {threads} threads");
    while running.load(Ordering::Relaxed) {
        let candidate = build_candidate(&blockchain, &mempool, &reward_address);
        let starting_tip = candidate.header.prev_hash;

        let still_current = Arc::new(AtomicBool::new(true));
        let watcher_stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let still_current = Arc::clone(&still_current);
            let watcher_stop = Arc::clone(&watcher_stop);
            let blockchain = Arc::clone(&blockchain);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                while !watcher_stop.load(Ordering::Relaxed) {
                    if !running.load(Ordering::Relaxed) || blockchain.tip_hash() != starting_tip {
                        still_current.store(false, Ordering::Relaxed);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
            })
        };

        let found = search_for_solution(&candidate, threads, &stats, &still_current);
        watcher_stop.store(true, Ordering::Relaxed);
        let _ = watcher.join();

        let Some(header) = found else { continue };
        let block = Block { header, height: candidate.height, transactions: candidate.transactions };
        match blockchain.accept_block(block.clone()) {
            Ok(()) => {
                stats.blocks_found.fetch_add(1, Ordering::Relaxed);
                info!("mining: found block {} at height {}", emberchain_core::hash_to_hex(&block.hash()), block.height);
                on_block(block);
            }
            Err(e) => warn!("mining: discarding solved block, consensus rejected it: {e}"),
        }
    }
    info!("mining: stopped");
}
