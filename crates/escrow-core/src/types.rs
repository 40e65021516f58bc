use crate::error::{CallErrorKind, EscrowError};
use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// `0x` followed by exactly 40 hex digits.
pub fn is_address(value: &str) -> bool {
    let Some(digits) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    else {
        return false;
    };
    digits.len() == 40 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn normalize_address(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(digits) => format!("0x{}", digits.to_ascii_lowercase()),
        None => trimmed.to_string(),
    }
}

/// Header-style abbreviation: the first five characters (`0x123`).
pub fn short_address(address: &str) -> String {
    address.chars().take(5).collect()
}

pub fn explorer_code_url(explorer_host: &str, contract_address: &str) -> String {
    format!(
        "https://{}/address/{}#code",
        explorer_host.trim_end_matches('/'),
        contract_address
    )
}

/// Render a raw token amount (smallest unit) as `"<amount> <symbol>"`.
pub fn format_token_amount(raw: U256, decimals: u32, symbol: &str) -> String {
    let scale = U256::from(10u8)
        .checked_pow(U256::from(decimals))
        .unwrap_or(U256::MAX);
    let whole = raw / scale;
    let fraction = raw % scale;
    if fraction.is_zero() {
        return format!("{} {}", whole, symbol);
    }
    let digits = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    format!("{}.{} {}", whole, digits.trim_end_matches('0'), symbol)
}

/// Observable state of the wallet session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub address: Option<String>,
    pub is_connected: bool,
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub content_uri: String,
}

/// Form state of the escrow creation page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EscrowCreationDraft {
    pub signer_address: String,
    pub judge_address: String,
    pub contract_asset_uri: Option<String>,
}

impl EscrowCreationDraft {
    pub fn has_addresses(&self) -> bool {
        !self.signer_address.trim().is_empty() && !self.judge_address.trim().is_empty()
    }

    /// Names of required fields that are still empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.signer_address.trim().is_empty() {
            missing.push("signer_address");
        }
        if self.judge_address.trim().is_empty() {
            missing.push("judge_address");
        }
        missing
    }
}

/// One event log from a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Emitting contract, lowercase `0x` form.
    pub address: String,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

/// Data delivered with a successful contract call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReceipt {
    pub call_id: Uuid,
    pub function_name: String,
    /// Set for write calls once the transaction is mined.
    pub transaction_hash: Option<String>,
    pub block_number: Option<u64>,
    /// Decoded return values. For writes these come from the pre-submission
    /// simulation and may differ from what the mined transaction did.
    pub return_values: Vec<DynSolValue>,
    /// Logs of the mined transaction; empty for reads.
    pub logs: Vec<LogEntry>,
    pub completed_at: DateTime<Utc>,
}

impl CallReceipt {
    /// Logs emitted by `address` in the mined transaction.
    pub fn logs_from<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        let address = normalize_address(address);
        self.logs.iter().filter(move |log| log.address == address)
    }
}

/// Error half of a call outcome, kept verbatim for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub name: String,
    pub message: String,
    pub kind: Option<CallErrorKind>,
}

impl From<&EscrowError> for CallFailure {
    fn from(err: &EscrowError) -> Self {
        let name = match err.call_kind() {
            Some(kind) => kind.name(),
            None => err.name(),
        };
        Self {
            name: name.to_string(),
            message: err.message(),
            kind: err.call_kind(),
        }
    }
}

impl From<EscrowError> for CallFailure {
    fn from(err: EscrowError) -> Self {
        Self::from(&err)
    }
}

impl From<CallFailure> for EscrowError {
    fn from(failure: CallFailure) -> Self {
        if let Some(kind) = failure.kind {
            return EscrowError::call(kind, failure.message);
        }
        match failure.name.as_str() {
            "ConnectionError" => EscrowError::Connection(failure.message),
            "UploadError" => EscrowError::upload_rejected(failure.message),
            "ValidationError" => EscrowError::Validation(failure.message),
            "AbiError" => EscrowError::Abi(failure.message),
            "ConfigError" => EscrowError::Config(failure.message),
            _ => EscrowError::call(CallErrorKind::Rpc, failure.message),
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Lifecycle of one submitted contract call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Pending,
    Success(CallReceipt),
    Error(CallFailure),
}

impl TransactionOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn receipt(&self) -> Option<&CallReceipt> {
        match self {
            Self::Success(receipt) => Some(receipt),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&CallFailure> {
        match self {
            Self::Error(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Judge dashboard tabs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    WaitingForJudge,
    Processing,
    #[default]
    Completed,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 3] = [
        EscrowStatus::WaitingForJudge,
        EscrowStatus::Processing,
        EscrowStatus::Completed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::WaitingForJudge => "waiting for judge",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    /// Map the escrow contract's `status()` code.
    pub fn from_code(code: U256) -> Option<Self> {
        match u8::try_from(code).ok()? {
            0 => Some(Self::WaitingForJudge),
            1 => Some(Self::Processing),
            2 => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::WaitingForJudge => 0,
            Self::Processing => 1,
            Self::Completed => 2,
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EscrowStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "waiting for judge" | "waitingforjudge" => Ok(Self::WaitingForJudge),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            _ => Err(EscrowError::Validation(format!(
                "unknown escrow status '{}'",
                s
            ))),
        }
    }
}

/// One escrow as listed on the judge dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Escrow instance address; unique key of the record.
    pub contract_address: String,
    pub name: String,
    pub payer_address: String,
    pub beneficiary_address: String,
    /// Display-formatted amount and symbol, e.g. `"1.5 MATIC"`.
    pub approved_balance: String,
    pub status: EscrowStatus,
    pub image_uri: String,
    /// Set when a write on this escrow went through but its state could not
    /// be read back; the record must be refreshed before further actions.
    #[serde(default)]
    pub needs_refresh: bool,
}

/// Result shown after a successful creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEscrow {
    pub contract_address: String,
    pub asset_uri: Option<String>,
    pub transaction_hash: Option<String>,
    pub explorer_url: String,
}
