//! Ethereum JSON-RPC adapters.
//!
//! [`JsonRpcWalletProvider`] talks to a signing wallet (EIP-1102 account
//! access, EIP-3326 chain switching). [`JsonRpcTransport`] reads from a node
//! and routes transactions through the wallet for signing.

use alloy_primitives::B256;
use async_trait::async_trait;
use escrow_core::abi::{from_hex_prefixed, to_hex_prefixed};
use escrow_core::config::ClientConfig;
use escrow_core::error::{CallErrorKind, EscrowError, EscrowResult};
use escrow_core::gateway::{ContractTransport, TransactionReceipt};
use escrow_core::types::{normalize_address, LogEntry};
use escrow_core::wallet::WalletProvider;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// EIP-1193 "user rejected the request".
const USER_REJECTED: i64 = 4001;
/// Node-side revert with data.
const EXECUTION_REVERTED: i64 = 3;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Map a JSON-RPC error object onto the call error taxonomy.
pub fn classify_rpc_error(code: i64, message: &str) -> EscrowError {
    let lowered = message.to_ascii_lowercase();
    let rejected = lowered.contains("user denied") || lowered.contains("user rejected");
    let kind = if code == USER_REJECTED || rejected {
        CallErrorKind::UserRejected
    } else if code == EXECUTION_REVERTED || lowered.contains("execution reverted") {
        CallErrorKind::Reverted
    } else if lowered.contains("insufficient funds") {
        CallErrorKind::InsufficientFunds
    } else {
        CallErrorKind::Rpc
    };
    EscrowError::call(kind, message)
}

/// Minimal JSON-RPC 2.0 client over HTTP.
pub struct JsonRpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str, timeout: Duration) -> EscrowResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EscrowError::Config(format!("cannot build JSON-RPC client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> EscrowResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, method, url = %self.url, "json-rpc request");

        let response = self
            .client
            .post(&self.url)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    CallErrorKind::Timeout
                } else {
                    CallErrorKind::Rpc
                };
                EscrowError::call(kind, format!("{} request failed: {}", method, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EscrowError::call(
                CallErrorKind::Rpc,
                format!("{} returned HTTP {}: {}", method, status.as_u16(), body),
            ));
        }

        let body: RpcResponse = response.json().await.map_err(|e| {
            EscrowError::call(CallErrorKind::Rpc, format!("{} response unreadable: {}", method, e))
        })?;
        if let Some(error) = body.error {
            return Err(classify_error_object(&error));
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null)).map_err(|e| {
            EscrowError::call(
                CallErrorKind::Rpc,
                format!("{} returned an unexpected result: {}", method, e),
            )
        })
    }
}

fn classify_error_object(error: &RpcErrorObject) -> EscrowError {
    classify_rpc_error(error.code, &error.message)
}

fn parse_quantity(value: &str) -> EscrowResult<u64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| {
        EscrowError::call(CallErrorKind::Rpc, format!("invalid quantity '{}': {}", value, e))
    })
}

fn to_connection_error(err: EscrowError) -> EscrowError {
    match err {
        EscrowError::Connection(_) => err,
        other => EscrowError::Connection(other.message()),
    }
}

/// Wallet reachable over JSON-RPC (desktop wallets, signer proxies).
pub struct JsonRpcWalletProvider {
    rpc: Arc<JsonRpcClient>,
}

impl JsonRpcWalletProvider {
    pub fn new(rpc: Arc<JsonRpcClient>) -> Self {
        Self { rpc }
    }

    pub fn from_config(config: &ClientConfig) -> EscrowResult<Self> {
        let rpc = JsonRpcClient::new(
            &config.wallet.provider_url,
            Duration::from_millis(config.gateway.receipt_timeout_ms),
        )?;
        Ok(Self::new(Arc::new(rpc)))
    }

    async fn ensure_chain(&self, chain_id: u64) -> EscrowResult<()> {
        let current: String = self.rpc.request("eth_chainId", json!([])).await?;
        if parse_quantity(&current)? == chain_id {
            return Ok(());
        }

        info!(from = %current, to = chain_id, "switching wallet chain");
        let _: Value = self
            .rpc
            .request(
                "wallet_switchEthereumChain",
                json!([{ "chainId": format!("0x{:x}", chain_id) }]),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WalletProvider for JsonRpcWalletProvider {
    fn provider_id(&self) -> &'static str {
        "json-rpc"
    }

    async fn request_accounts(&self, chain_id: u64) -> EscrowResult<String> {
        self.ensure_chain(chain_id)
            .await
            .map_err(to_connection_error)?;

        let accounts: Vec<String> = self
            .rpc
            .request("eth_requestAccounts", json!([]))
            .await
            .map_err(to_connection_error)?;
        accounts
            .into_iter()
            .next()
            .ok_or_else(|| EscrowError::Connection("wallet returned no accounts".to_string()))
    }

    async fn disconnect(&self) -> EscrowResult<()> {
        let result: EscrowResult<Value> = self
            .rpc
            .request("wallet_revokePermissions", json!([{ "eth_accounts": {} }]))
            .await;
        match result {
            Ok(_) => Ok(()),
            // Wallets without EIP-2255 keep the permission; the session still ends.
            Err(err) if is_unsupported(&err) => {
                debug!(error = %err, "wallet does not support permission revocation");
                Ok(())
            }
            Err(err) => Err(to_connection_error(err)),
        }
    }
}

fn is_unsupported(err: &EscrowError) -> bool {
    let message = err.message().to_ascii_lowercase();
    message.contains("not found") || message.contains("not supported")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
}

impl RpcLog {
    fn into_entry(self) -> EscrowResult<LogEntry> {
        let topics = self
            .topics
            .iter()
            .map(|topic| {
                let bytes = from_hex_prefixed(topic)?;
                B256::try_from(bytes.as_slice()).map_err(|_| {
                    EscrowError::Abi(format!("log topic '{}' is not 32 bytes", topic))
                })
            })
            .collect::<EscrowResult<Vec<_>>>()?;
        Ok(LogEntry {
            address: normalize_address(&self.address),
            topics,
            data: from_hex_prefixed(&self.data)?,
        })
    }
}

/// Contract transport: reads from `node`, signs through `signer`.
pub struct JsonRpcTransport {
    node: Arc<JsonRpcClient>,
    signer: Arc<JsonRpcClient>,
}

impl JsonRpcTransport {
    pub fn new(node: Arc<JsonRpcClient>, signer: Arc<JsonRpcClient>) -> Self {
        Self { node, signer }
    }

    pub fn from_config(config: &ClientConfig) -> EscrowResult<Self> {
        let read_timeout = Duration::from_millis(config.gateway.read_timeout_ms);
        let node = JsonRpcClient::new(&config.chain.rpc_url, read_timeout)?;
        // Signing waits on the user, so it gets the receipt budget.
        let signer = JsonRpcClient::new(
            &config.wallet.provider_url,
            Duration::from_millis(config.gateway.receipt_timeout_ms),
        )?;
        Ok(Self::new(Arc::new(node), Arc::new(signer)))
    }
}

#[async_trait]
impl ContractTransport for JsonRpcTransport {
    fn transport_id(&self) -> &'static str {
        "json-rpc"
    }

    async fn call(&self, from: Option<&str>, to: &str, data: &[u8]) -> EscrowResult<Vec<u8>> {
        let mut call = json!({ "to": to, "data": to_hex_prefixed(data) });
        if let Some(from) = from {
            call["from"] = json!(from);
        }
        let result: String = self.node.request("eth_call", json!([call, "latest"])).await?;
        from_hex_prefixed(&result).map_err(|e| EscrowError::call(CallErrorKind::Encoding, e.message()))
    }

    async fn send_transaction(&self, from: &str, to: &str, data: &[u8]) -> EscrowResult<String> {
        let transaction = json!({ "from": from, "to": to, "data": to_hex_prefixed(data) });
        self.signer
            .request("eth_sendTransaction", json!([transaction]))
            .await
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> EscrowResult<Option<TransactionReceipt>> {
        let receipt: Option<RpcReceipt> = self
            .node
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        receipt
            .map(|receipt| -> EscrowResult<TransactionReceipt> {
                let block_number = receipt.block_number.as_deref().map(parse_quantity).transpose()?;
                let logs = receipt
                    .logs
                    .into_iter()
                    .map(RpcLog::into_entry)
                    .collect::<EscrowResult<Vec<_>>>()
                    .map_err(|e| EscrowError::call(CallErrorKind::Encoding, e.message()))?;
                Ok(TransactionReceipt {
                    transaction_hash: receipt.transaction_hash,
                    block_number,
                    // Pre-Byzantium receipts carry no status; treat them as mined.
                    success: receipt.status.as_deref().map_or(true, |status| status == "0x1"),
                    logs,
                })
            })
            .transpose()
    }
}
