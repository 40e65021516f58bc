//! Escrow dApp client core.
//!
//! View-models and services for the escrow workflow: wallet session, asset
//! upload to content-addressed storage, contract calls against the escrow
//! factory and escrow instances, and the judge dashboard. Chain, wallet and
//! storage access sit behind traits; concrete adapters live in
//! `escrow-adapters`.

#![deny(unsafe_code)]

pub mod abi;
pub mod board;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod telemetry;
pub mod types;
pub mod uploader;
pub mod wallet;
pub mod workflow;

pub use abi::{
    address_value, format_address, parse_address, value_address, value_uint, AbiDescriptor,
    FunctionCodec,
};
pub use alloy_dyn_abi::DynSolValue;
pub use alloy_primitives::{Address, B256, U256};
pub use board::{placeholder_records, ApprovalReceipt, EscrowBoard, StatusCounts, VisibleRecords};
pub use config::{
    ChainConfig, ClientConfig, ContractsConfig, GatewaySettings, LoggingConfig, StorageConfig,
    WalletConfig,
};
pub use error::{CallErrorKind, EscrowError, EscrowResult};
pub use gateway::{
    CallHandle, CallKind, ContractCallGateway, ContractCallRequest, ContractTransport,
    GatewayConfig, TransactionReceipt,
};
pub use notify::{Notification, NotificationCenter, NotificationLevel};
pub use telemetry::init_tracing;
pub use types::{
    explorer_code_url, format_token_amount, is_address, normalize_address, short_address,
    CallFailure, CallReceipt, CreatedEscrow, EscrowCreationDraft, EscrowRecord, EscrowStatus,
    LogEntry, TransactionOutcome, UploadResult, WalletSnapshot,
};
pub use uploader::{AssetFile, AssetUploader, ContentStore, RetryPolicy, StoredContent, UploadMetadata};
pub use wallet::{WalletEvent, WalletProvider, WalletSession};
pub use workflow::{
    EscrowCreationWorkflow, WorkflowSettings, WorkflowStage, CREATED_EVENT, CREATE_FUNCTION,
};
