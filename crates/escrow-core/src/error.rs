use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of contract call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// The wallet refused to sign (user pressed "reject").
    UserRejected,
    InsufficientFunds,
    /// Transport or node failure.
    Rpc,
    /// The contract reverted, either in simulation or on-chain.
    Reverted,
    Timeout,
    Cancelled,
    /// Arguments or return data did not match the ABI.
    Encoding,
}

impl CallErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::UserRejected => "UserRejectedRequestError",
            Self::InsufficientFunds => "InsufficientFundsError",
            Self::Rpc => "RpcError",
            Self::Reverted => "ContractRevertError",
            Self::Timeout => "TimeoutError",
            Self::Cancelled => "CancelledError",
            Self::Encoding => "EncodingError",
        }
    }
}

/// Escrow client errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("Wallet connection failed: {0}")]
    Connection(String),

    #[error("Asset upload failed: {message}")]
    Upload { message: String, transient: bool },

    #[error("Contract call failed ({}): {message}", .kind.name())]
    Call {
        kind: CallErrorKind,
        message: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EscrowError {
    /// Stable error name shown in user notifications.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection(_) => "ConnectionError",
            Self::Upload { .. } => "UploadError",
            Self::Call { .. } => "CallError",
            Self::Validation(_) => "ValidationError",
            Self::Abi(_) => "AbiError",
            Self::Config(_) => "ConfigError",
        }
    }

    /// Human-readable message without the category prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Connection(message)
            | Self::Validation(message)
            | Self::Abi(message)
            | Self::Config(message) => message.clone(),
            Self::Upload { message, .. } | Self::Call { message, .. } => message.clone(),
        }
    }

    pub fn upload_transient(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            transient: true,
        }
    }

    pub fn upload_rejected(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            transient: false,
        }
    }

    pub fn call(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self::Call {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::Validation(format!("'{}' is required before submission", field))
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Upload {
                transient: true,
                ..
            }
        )
    }

    pub fn call_kind(&self) -> Option<CallErrorKind> {
        match self {
            Self::Call { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for escrow client operations.
pub type EscrowResult<T> = Result<T, EscrowError>;
