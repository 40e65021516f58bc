//! Contract call gateway.
//!
//! Turns a validated [`ContractCallRequest`] into a [`TransactionOutcome`].
//! Reads are bounded by a timeout. Writes are simulated first so reverts
//! surface before the wallet prompt, then handed to the wallet and followed
//! until a receipt appears. Nothing is retried here: resubmitting a write is
//! always the caller's decision.

use crate::abi::{AbiDescriptor, FunctionCodec};
use crate::error::{CallErrorKind, EscrowError, EscrowResult};
use crate::types::{
    is_address, normalize_address, CallFailure, CallReceipt, LogEntry, TransactionOutcome,
};
use alloy_dyn_abi::DynSolValue;
use alloy_json_abi::Function;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mined transaction as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// Chain access used by the gateway.
#[async_trait]
pub trait ContractTransport: Send + Sync {
    fn transport_id(&self) -> &'static str;

    /// Execute `data` against `to` without creating a transaction.
    async fn call(&self, from: Option<&str>, to: &str, data: &[u8]) -> EscrowResult<Vec<u8>>;

    /// Hand a transaction to the wallet for signing and broadcast.
    /// Returns the transaction hash.
    async fn send_transaction(&self, from: &str, to: &str, data: &[u8]) -> EscrowResult<String>;

    /// `None` while the transaction is not yet mined.
    async fn transaction_receipt(&self, tx_hash: &str)
        -> EscrowResult<Option<TransactionReceipt>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Read,
    Write,
}

/// A contract call, validated against its ABI at construction.
#[derive(Debug, Clone)]
pub struct ContractCallRequest {
    address: String,
    abi: Arc<AbiDescriptor>,
    function: Function,
    args: Vec<DynSolValue>,
}

impl ContractCallRequest {
    pub fn new(
        address: &str,
        abi: Arc<AbiDescriptor>,
        function_name: &str,
        args: Vec<DynSolValue>,
    ) -> EscrowResult<Self> {
        if !is_address(address) {
            return Err(EscrowError::Validation(format!(
                "contract address '{}' is not a 20-byte hex address",
                address
            )));
        }
        let function = abi.function(function_name)?.clone();
        function.check_args(&args)?;

        Ok(Self {
            address: normalize_address(address),
            abi,
            function,
            args,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn abi(&self) -> &AbiDescriptor {
        &self.abi
    }

    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn args(&self) -> &[DynSolValue] {
        &self.args
    }

    pub fn kind(&self) -> CallKind {
        if self.function.is_read_only() {
            CallKind::Read
        } else {
            CallKind::Write
        }
    }

    pub fn calldata(&self) -> EscrowResult<Vec<u8>> {
        self.function.encode_call(&self.args).map_err(as_encoding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    pub read_timeout: Duration,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(15),
            receipt_timeout: Duration::from_secs(180),
            receipt_poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct ContractCallGateway {
    transport: Arc<dyn ContractTransport>,
    config: GatewayConfig,
}

impl ContractCallGateway {
    pub fn new(transport: Arc<dyn ContractTransport>, config: GatewayConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run one call to completion. `from` is required for writes.
    pub async fn call(&self, from: Option<&str>, request: &ContractCallRequest) -> TransactionOutcome {
        let call_id = Uuid::new_v4();
        debug!(
            %call_id,
            contract = request.address(),
            function = request.function_name(),
            kind = ?request.kind(),
            "contract call submitted"
        );

        match self.execute(call_id, from, request).await {
            Ok(receipt) => {
                info!(
                    %call_id,
                    function = request.function_name(),
                    tx_hash = receipt.transaction_hash.as_deref().unwrap_or("-"),
                    "contract call succeeded"
                );
                TransactionOutcome::Success(receipt)
            }
            Err(err) => {
                warn!(
                    %call_id,
                    function = request.function_name(),
                    error = %err,
                    "contract call failed"
                );
                TransactionOutcome::Error(CallFailure::from(&err))
            }
        }
    }

    /// Read call returning decoded values.
    pub async fn read(&self, request: &ContractCallRequest) -> EscrowResult<Vec<DynSolValue>> {
        if request.kind() != CallKind::Read {
            return Err(EscrowError::Validation(format!(
                "{} is not a read-only function",
                request.function().signature()
            )));
        }
        let receipt = self.execute(Uuid::new_v4(), None, request).await?;
        Ok(receipt.return_values)
    }

    /// Start a call in the background and return a handle that can be
    /// awaited, observed or cancelled.
    pub fn submit(self: &Arc<Self>, from: Option<String>, request: ContractCallRequest) -> CallHandle {
        let (sender, receiver) = watch::channel(TransactionOutcome::Pending);
        let sender = Arc::new(sender);

        let gateway = Arc::clone(self);
        let task_sender = Arc::clone(&sender);
        let task = tokio::spawn(async move {
            let outcome = gateway.call(from.as_deref(), &request).await;
            settle(&task_sender, outcome);
        });

        CallHandle {
            receiver,
            sender,
            task,
        }
    }

    async fn execute(
        &self,
        call_id: Uuid,
        from: Option<&str>,
        request: &ContractCallRequest,
    ) -> EscrowResult<CallReceipt> {
        let calldata = request.calldata()?;

        match request.kind() {
            CallKind::Read => {
                let raw = self.bounded_call(from, request.address(), &calldata).await?;
                let return_values = request.function().decode_output(&raw).map_err(as_encoding)?;
                Ok(CallReceipt {
                    call_id,
                    function_name: request.function_name().to_string(),
                    transaction_hash: None,
                    block_number: None,
                    return_values,
                    logs: Vec::new(),
                    completed_at: Utc::now(),
                })
            }
            CallKind::Write => {
                let from = from.ok_or_else(|| {
                    EscrowError::Validation("write calls require a connected wallet".to_string())
                })?;

                let simulated = self
                    .bounded_call(Some(from), request.address(), &calldata)
                    .await?;
                let return_values = request
                    .function()
                    .decode_output(&simulated)
                    .map_err(as_encoding)?;

                let tx_hash = self
                    .transport
                    .send_transaction(from, request.address(), &calldata)
                    .await?;
                info!(%call_id, tx_hash = %tx_hash, "transaction handed to wallet");

                let receipt = self.wait_for_receipt(&tx_hash).await?;
                if !receipt.success {
                    return Err(EscrowError::call(
                        CallErrorKind::Reverted,
                        format!("transaction {} reverted on-chain", tx_hash),
                    ));
                }

                Ok(CallReceipt {
                    call_id,
                    function_name: request.function_name().to_string(),
                    transaction_hash: Some(receipt.transaction_hash),
                    block_number: receipt.block_number,
                    return_values,
                    logs: receipt.logs,
                    completed_at: Utc::now(),
                })
            }
        }
    }

    async fn bounded_call(&self, from: Option<&str>, to: &str, data: &[u8]) -> EscrowResult<Vec<u8>> {
        timeout(self.config.read_timeout, self.transport.call(from, to, data))
            .await
            .map_err(|_| {
                EscrowError::call(
                    CallErrorKind::Timeout,
                    format!(
                        "{} did not answer within {:?}",
                        self.transport.transport_id(),
                        self.config.read_timeout
                    ),
                )
            })?
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> EscrowResult<TransactionReceipt> {
        let deadline = Instant::now() + self.config.receipt_timeout;
        loop {
            if let Some(receipt) = self.transport.transaction_receipt(tx_hash).await? {
                return Ok(receipt);
            }
            if Instant::now() >= deadline {
                return Err(EscrowError::call(
                    CallErrorKind::Timeout,
                    format!(
                        "transaction {} not mined within {:?}; it may still be included later",
                        tx_hash, self.config.receipt_timeout
                    ),
                ));
            }
            sleep(self.config.receipt_poll_interval).await;
        }
    }
}

fn as_encoding(err: EscrowError) -> EscrowError {
    match err {
        EscrowError::Abi(message) => EscrowError::call(CallErrorKind::Encoding, message),
        other => other,
    }
}

/// Moves the outcome from `Pending` to a terminal state exactly once.
fn settle(sender: &watch::Sender<TransactionOutcome>, outcome: TransactionOutcome) -> bool {
    sender.send_if_modified(|current| {
        if current.is_pending() {
            *current = outcome;
            true
        } else {
            false
        }
    })
}

/// Handle to a call started with [`ContractCallGateway::submit`].
pub struct CallHandle {
    receiver: watch::Receiver<TransactionOutcome>,
    sender: Arc<watch::Sender<TransactionOutcome>>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub fn current(&self) -> TransactionOutcome {
        self.receiver.borrow().clone()
    }

    /// Observers see `Pending` followed by exactly one terminal outcome.
    pub fn subscribe(&self) -> watch::Receiver<TransactionOutcome> {
        self.receiver.clone()
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(&self) -> TransactionOutcome {
        let mut receiver = self.receiver.clone();
        let settled = receiver
            .wait_for(TransactionOutcome::is_terminal)
            .await
            .map(|outcome| outcome.clone());
        match settled {
            Ok(outcome) => outcome,
            Err(_) => self.current(),
        }
    }

    /// Abort the call. Returns `false` if it had already settled.
    ///
    /// A transaction already handed to the wallet cannot be recalled and may
    /// still be mined.
    pub fn cancel(&self) -> bool {
        self.task.abort();
        settle(
            &self.sender,
            TransactionOutcome::Error(CallFailure::from(EscrowError::call(
                CallErrorKind::Cancelled,
                "call cancelled before completion",
            ))),
        )
    }
}
