//! Adapters for escrow-core.
//!
//! HTTP clients for content-addressed storage and JSON-RPC wallets/nodes,
//! plus deterministic in-memory stand-ins for local runs and tests.

#![deny(unsafe_code)]

pub mod fixtures;
pub mod json_rpc;
pub mod nft_storage;

pub use fixtures::{
    FlakyContentStore, InMemoryContentStore, RejectingWalletProvider, SimulatedEscrow,
    SimulatedEscrowChain, StaticWalletProvider,
};
pub use json_rpc::{classify_rpc_error, JsonRpcClient, JsonRpcTransport, JsonRpcWalletProvider};
pub use nft_storage::NftStorageClient;
