//! Emberchain JSON-RPC API.
//!
//! A small JSON-RPC 2.0 surface over HTTP exposing wallet, transaction, and
//! node-control operations to external callers: `new_wallet`, `send`,
//! `get_balance`, `mine`, `peer_add`, `peer_list`, `chain_info`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Json},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

use emberchain_consensus::Blockchain;
use emberchain_crypto::Address;
use emberchain_mempool::Mempool;
use emberchain_network::NetworkService;
use emberchain_storage::BlockStore;

pub mod keystore;
pub mod methods;

pub use keystore::KeyStore;

/// JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const INVALID_ADDRESS: i32 = -1;
    pub const TX_VALIDATION_ERROR: i32 = -2;
    pub const NOT_FOUND: i32 = -4;
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("transaction rejected: {0}")]
    TxValidationError(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl RpcError {
    pub fn code(&self) -> i32 {
        match self {
            RpcError::ParseError(_) => error_codes::PARSE_ERROR,
            RpcError::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            RpcError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => error_codes::INVALID_PARAMS,
            RpcError::InternalError(_) => error_codes::INTERNAL_ERROR,
            RpcError::InvalidAddress(_) => error_codes::INVALID_ADDRESS,
            RpcError::TxValidationError(_) => error_codes::TX_VALIDATION_ERROR,
            RpcError::NotFound(_) => error_codes::NOT_FOUND,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for JsonRpcError {
    fn from(error: RpcError) -> Self {
        JsonRpcError { code: error.code(), message: error.to_string(), data: None }
    }
}

/// Everything an RPC method needs to answer a request: the node's live
/// consensus/mempool/network state, its block store, and the in-memory
/// keystore backing `new_wallet`/`send`.
#[derive(Clone)]
pub struct RpcContext {
    pub blockchain: Arc<Blockchain>,
    pub mempool: Arc<Mempool>,
    pub network: Arc<NetworkService>,
    pub block_store: Arc<dyn BlockStore>,
    pub keystore: Arc<KeyStore>,
    /// Address `mine` pays the subsidy to when the caller doesn't supply one.
    pub default_reward_address: Option<Address>,
    pub mining_threads: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcConfig {
    pub bind_addr: SocketAddr,
    pub cors_domains: Vec<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig { bind_addr: "127.0.0.1:8332".parse().unwrap(), cors_domains: vec![] }
    }
}

pub struct RpcServer {
    config: RpcConfig,
    context: RpcContext,
}

impl RpcServer {
    pub fn new(config: RpcConfig, context: RpcContext) -> Self {
        RpcServer { config, context }
    }

    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("rpc: starting JSON-RPC server on {}", self.config.bind_addr);

        let app = Router::new()
            .route("/", post(handle_rpc_request))
            .layer(Extension(self.context.clone()))
            .layer(cors_layer(&self.config.cors_domains));

        axum::Server::bind(&self.config.bind_addr).serve(app.into_make_service()).await?;

        Ok(())
    }
}

/// Builds the CORS layer from the configured allowed origins: permissive
/// (`Access-Control-Allow-Origin: *`) when the list is empty, otherwise
/// restricted to exactly those origins.
fn cors_layer(cors_domains: &[String]) -> CorsLayer {
    if cors_domains.is_empty() {
        return CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = cors_domains.iter().filter_map(|domain| domain.parse().ok()).collect();
    CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(origins)
}

async fn handle_rpc_request(Extension(context): Extension<RpcContext>, Json(request): Json<JsonRpcRequest>) -> impl IntoResponse {
    debug!("rpc: received request: {}", request.method);

    if request.jsonrpc != "2.0" {
        return create_error_response(RpcError::InvalidRequest("expected jsonrpc 2.0".to_string()), request.id.unwrap_or(Value::Null));
    }

    let id = request.id.unwrap_or(Value::Null);

    let result = match request.method.as_str() {
        "new_wallet" => methods::new_wallet(&context, request.params).await,
        "send" => methods::send(&context, request.params).await,
        "get_balance" => methods::get_balance(&context, request.params).await,
        "mine" => methods::mine(&context, request.params).await,
        "peer_add" => methods::peer_add(&context, request.params).await,
        "peer_list" => methods::peer_list(&context, request.params).await,
        "chain_info" => methods::chain_info(&context, request.params).await,
        _ => Err(RpcError::MethodNotFound(request.method)),
    };

    match result {
        Ok(result) => create_success_response(result, id),
        Err(error) => create_error_response(error, id),
    }
}

fn create_success_response(result: Value, id: Value) -> Response {
    let response = JsonRpcResponse { jsonrpc: "2.0".to_string(), result: Some(result), error: None, id };
    (StatusCode::OK, Json(response)).into_response()
}

fn create_error_response(error: RpcError, id: Value) -> Response {
    let response = JsonRpcResponse { jsonrpc: "2.0".to_string(), result: None, error: Some(error.into()), id };
    (StatusCode::OK, Json(response)).into_response()
}
