//! JSON-RPC method implementations.
//!
//! Each method takes the shared `RpcContext` and the request's raw `params`
//! value, accepting either a JSON object (named fields) or a positional
//! array — whichever is more convenient for the caller.

use std::net::SocketAddr;

use serde_json::{json, Value};

use emberchain_consensus::difficulty::get_target_from_bits;
use emberchain_core::consts::MIN_RELAY_FEE;
use emberchain_core::{Block, Transaction, TxInput, TxOutput};
use emberchain_crypto::Address;
use emberchain_network::{NetworkCommand, SyncState};

use crate::{RpcContext, RpcError};

/// Reads a string field out of `params`, whether it was sent as an object
/// (`key`) or a positional array (`index`).
fn param_str<'a>(params: &'a Value, key: &str, index: usize) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .or_else(|| params.as_array().and_then(|a| a.get(index)).and_then(Value::as_str))
}

fn param_u64(params: &Value, key: &str, index: usize) -> Option<u64> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .or_else(|| params.as_array().and_then(|a| a.get(index)).and_then(Value::as_u64))
}

fn parse_address(s: &str) -> Result<Address, RpcError> {
    Address::from_base58check(s).map_err(|_| RpcError::InvalidAddress(s.to_string()))
}

/// Generates a fresh keypair held by the node's in-memory keystore and
/// returns its address. The private key never leaves the node.
pub async fn new_wallet(context: &RpcContext, _params: Option<Value>) -> Result<Value, RpcError> {
    let address = context.keystore.generate().await;
    Ok(json!({ "address": address.to_base58check() }))
}

/// Sums every UTXO paying `address`.
pub async fn get_balance(context: &RpcContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params = params.ok_or_else(|| RpcError::InvalidParams("missing parameters".to_string()))?;
    let address_str = param_str(&params, "address", 0).ok_or_else(|| RpcError::InvalidParams("missing 'address'".to_string()))?;
    let address = parse_address(address_str)?;

    let script_pubkey = address.to_base58check();
    let balance: u64 = context
        .blockchain
        .utxo_set()
        .export()
        .into_iter()
        .filter(|record| record.output.script_pubkey == script_pubkey)
        .map(|record| record.output.amount)
        .sum();

    Ok(json!({ "address": address_str, "balance": balance }))
}

/// Builds, signs, and broadcasts a transaction spending `from`'s UTXOs.
/// `from` must be an address the node's keystore holds the key for (i.e.
/// one returned by a prior `new_wallet` call on this node).
pub async fn send(context: &RpcContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params = params.ok_or_else(|| RpcError::InvalidParams("missing parameters".to_string()))?;
    let from_str = param_str(&params, "from", 0).ok_or_else(|| RpcError::InvalidParams("missing 'from'".to_string()))?;
    let to_str = param_str(&params, "to", 1).ok_or_else(|| RpcError::InvalidParams("missing 'to'".to_string()))?;
    let amount = param_u64(&params, "amount", 2).ok_or_else(|| RpcError::InvalidParams("missing 'amount'".to_string()))?;
    let fee = param_u64(&params, "fee", 3).unwrap_or(MIN_RELAY_FEE);

    let from = parse_address(from_str)?;
    let to = parse_address(to_str)?;

    let (secret_key, public_key) = context
        .keystore
        .get(&from)
        .await
        .ok_or_else(|| RpcError::InvalidParams(format!("node holds no key for address {from_str}")))?;

    let required = amount.checked_add(fee).ok_or_else(|| RpcError::InvalidParams("amount overflow".to_string()))?;

    let script_pubkey = from.to_base58check();
    let mut spendable = context
        .blockchain
        .utxo_set()
        .export()
        .into_iter()
        .filter(|record| record.output.script_pubkey == script_pubkey)
        .collect::<Vec<_>>();
    spendable.sort_by(|a, b| b.output.amount.cmp(&a.output.amount));

    let mut inputs = Vec::new();
    let mut total_in: u64 = 0;
    for record in &spendable {
        if total_in >= required {
            break;
        }
        inputs.push(TxInput { prev: record.outpoint, signature: Vec::new(), pubkey: Vec::new(), sequence: u32::MAX });
        total_in += record.output.amount;
    }
    if total_in < required {
        return Err(RpcError::TxValidationError(format!("insufficient funds: have {total_in}, need {required}")));
    }

    let mut outputs = vec![TxOutput { amount, script_pubkey: to.to_base58check() }];
    let change = total_in - required;
    if change > 0 {
        outputs.push(TxOutput { amount: change, script_pubkey: from.to_base58check() });
    }

    let mut tx = Transaction { version: 1, chain_id: context.blockchain.params().chain_id, inputs, outputs, locktime: 0 };
    for index in 0..tx.inputs.len() {
        tx.sign_input(index, &secret_key, &public_key).map_err(|e| RpcError::InternalError(e.to_string()))?;
    }

    context
        .mempool
        .admit(tx.clone(), &context.blockchain, emberchain_core::current_timestamp())
        .map_err(|e| RpcError::TxValidationError(e.to_string()))?;
    context.network.broadcast_transaction(&tx).await;

    Ok(json!({ "txid": hex::encode(tx.txid()) }))
}

/// Mines `blocks` (default 1) blocks on this node's own CPU, paying the
/// subsidy to `address` (or the node's configured default reward address),
/// applying, persisting, and broadcasting each one found.
pub async fn mine(context: &RpcContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params = params.unwrap_or(Value::Null);
    let count = param_u64(&params, "blocks", 0).unwrap_or(1).max(1);
    let address = match param_str(&params, "address", 1) {
        Some(s) => parse_address(s)?,
        None => context
            .default_reward_address
            .ok_or_else(|| RpcError::InvalidParams("no reward address configured or supplied".to_string()))?,
    };

    let threads = context.mining_threads.max(1);
    let mut mined = Vec::new();

    for _ in 0..count {
        let blockchain = context.blockchain.clone();
        let mempool = context.mempool.clone();
        let block = tokio::task::spawn_blocking(move || {
            let candidate = emberchain_mining::build_candidate(&blockchain, &mempool, &address);
            let stats = emberchain_mining::MiningStats::default();
            let still_current = std::sync::atomic::AtomicBool::new(true);
            emberchain_mining::search_for_solution(&candidate, threads, &stats, &still_current)
                .map(|header| Block { header, height: candidate.height, transactions: candidate.transactions })
        })
        .await
        .map_err(|e| RpcError::InternalError(e.to_string()))?;

        let Some(block) = block else { break };
        context.blockchain.accept_block(block.clone()).map_err(|e| RpcError::InternalError(e.to_string()))?;
        context.block_store.store_block(&block).await.map_err(|e| RpcError::InternalError(e.to_string()))?;
        context.block_store.set_best_block(&block.hash()).await.map_err(|e| RpcError::InternalError(e.to_string()))?;
        context.mempool.remove_confirmed(&block);
        context.network.broadcast_block(&block).await;
        mined.push(hex::encode(block.hash()));
    }

    Ok(json!({ "blocks_mined": mined }))
}

/// Asks the network service to dial a peer.
pub async fn peer_add(context: &RpcContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params = params.ok_or_else(|| RpcError::InvalidParams("missing parameters".to_string()))?;
    let addr_str = param_str(&params, "addr", 0).ok_or_else(|| RpcError::InvalidParams("missing 'addr'".to_string()))?;
    let addr: SocketAddr = addr_str.parse().map_err(|_| RpcError::InvalidParams(format!("invalid socket address: {addr_str}")))?;

    context
        .network
        .command_sender()
        .send(NetworkCommand::Connect(addr))
        .await
        .map_err(|e| RpcError::InternalError(e.to_string()))?;

    Ok(json!({ "connecting": addr_str }))
}

/// Lists currently connected peers and their handshake state.
pub async fn peer_list(context: &RpcContext, _params: Option<Value>) -> Result<Value, RpcError> {
    let peers = context.network.connected_peers().await;
    let list: Vec<Value> = peers
        .iter()
        .map(|peer| {
            json!({
                "addr": peer.addr.to_string(),
                "inbound": peer.inbound,
                "state": format!("{:?}", peer.state),
                "version": peer.version,
                "start_height": peer.start_height,
                "user_agent": peer.user_agent,
                "ban_score": peer.ban_score,
            })
        })
        .collect();
    Ok(json!(list))
}

/// Summarizes this node's view of the chain: tip, difficulty, sync
/// progress, peer count, and mempool size.
pub async fn chain_info(context: &RpcContext, _params: Option<Value>) -> Result<Value, RpcError> {
    let height = context.blockchain.height();
    let tip_hash = context.blockchain.tip_hash();
    let tip_header = context.blockchain.tip_header();
    let target = get_target_from_bits(tip_header.bits);

    let sync = match context.network.sync_state().await {
        SyncState::Idle => json!({ "state": "idle" }),
        SyncState::Synced => json!({ "state": "synced" }),
        SyncState::Syncing { current_height, target_height } => {
            json!({ "state": "syncing", "current_height": current_height, "target_height": target_height })
        }
    };

    Ok(json!({
        "network": context.blockchain.params().network.to_string(),
        "height": height,
        "tip_hash": hex::encode(tip_hash),
        "bits": format!("{:#x}", tip_header.bits),
        "target": hex::encode(target),
        "peer_count": context.network.peer_count().await,
        "mempool_size": context.mempool.len(),
        "sync": sync,
    }))
}
