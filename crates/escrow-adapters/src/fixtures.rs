//! Deterministic in-memory stand-ins for storage, wallets and the chain.

use async_trait::async_trait;
use alloy_dyn_abi::DynSolValue;
use alloy_primitives::U256;
use escrow_core::abi::{
    address_value, keccak256, to_hex_prefixed, value_address, AbiDescriptor, FunctionCodec,
};
use escrow_core::error::{CallErrorKind, EscrowError, EscrowResult};
use escrow_core::gateway::{ContractTransport, TransactionReceipt};
use escrow_core::types::{normalize_address, EscrowStatus, LogEntry};
use escrow_core::uploader::{AssetFile, ContentStore, StoredContent, UploadMetadata};
use escrow_core::wallet::WalletProvider;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Content-addressed store keyed by the BLAKE3 digest of metadata and bytes.
#[derive(Default)]
pub struct InMemoryContentStore {
    objects: Mutex<HashMap<String, (UploadMetadata, Vec<u8>)>>,
    writes: AtomicUsize,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_uri(metadata: &UploadMetadata, file: &AssetFile) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(metadata.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(metadata.description.as_bytes());
        hasher.update(&[0]);
        hasher.update(&file.bytes);
        format!("ipfs://bafy{}/metadata.json", hex::encode(&hasher.finalize().as_bytes()[..16]))
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(uri).map(|(_, bytes)| bytes.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    fn store_id(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, metadata: &UploadMetadata, file: &AssetFile) -> EscrowResult<StoredContent> {
        let url = Self::content_uri(metadata, file);
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.objects)
            .entry(url.clone())
            .or_insert_with(|| (metadata.clone(), file.bytes.clone()));
        Ok(StoredContent { url })
    }
}

/// Fails with a transient error a fixed number of times, then stores.
pub struct FlakyContentStore {
    inner: InMemoryContentStore,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyContentStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryContentStore::new(),
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryContentStore {
        &self.inner
    }
}

#[async_trait]
impl ContentStore for FlakyContentStore {
    fn store_id(&self) -> &'static str {
        "flaky"
    }

    async fn store(&self, metadata: &UploadMetadata, file: &AssetFile) -> EscrowResult<StoredContent> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EscrowError::upload_transient("503: service unavailable"));
        }
        self.inner.store(metadata, file).await
    }
}

/// Wallet that always grants access to one account.
pub struct StaticWalletProvider {
    address: String,
    requests: AtomicUsize,
    disconnects: AtomicUsize,
}

impl StaticWalletProvider {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            requests: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletProvider for StaticWalletProvider {
    fn provider_id(&self) -> &'static str {
        "static"
    }

    async fn request_accounts(&self, _chain_id: u64) -> EscrowResult<String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.address.clone())
    }

    async fn disconnect(&self) -> EscrowResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Missing or refusing wallet.
pub struct RejectingWalletProvider {
    message: String,
}

impl RejectingWalletProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for RejectingWalletProvider {
    fn default() -> Self {
        Self::new("no injected wallet found")
    }
}

#[async_trait]
impl WalletProvider for RejectingWalletProvider {
    fn provider_id(&self) -> &'static str {
        "rejecting"
    }

    async fn request_accounts(&self, _chain_id: u64) -> EscrowResult<String> {
        Err(EscrowError::Connection(self.message.clone()))
    }
}

/// One escrow instance held by [`SimulatedEscrowChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedEscrow {
    pub payer: String,
    pub beneficiary: String,
    pub judge: String,
    pub status: EscrowStatus,
    pub approved_balance: U256,
    pub asset_uri: String,
}

#[derive(Default)]
struct ChainState {
    escrows: BTreeMap<String, SimulatedEscrow>,
    receipts: HashMap<String, TransactionReceipt>,
    next_proxy: Option<String>,
    revert_reason: Option<String>,
    nonce: u64,
    block: u64,
}

/// In-memory escrow factory and escrow instances.
///
/// Calldata is decoded against the bundled ABIs, so requests are checked the
/// same way a node would. Transactions are mined immediately.
pub struct SimulatedEscrowChain {
    factory: String,
    factory_abi: AbiDescriptor,
    escrow_abi: AbiDescriptor,
    state: Mutex<ChainState>,
    calls: AtomicUsize,
    sends: AtomicUsize,
}

impl SimulatedEscrowChain {
    pub fn new(factory: &str) -> EscrowResult<Self> {
        Ok(Self {
            factory: normalize_address(factory),
            factory_abi: AbiDescriptor::escrow_factory()?,
            escrow_abi: AbiDescriptor::escrow()?,
            state: Mutex::new(ChainState::default()),
            calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        })
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    /// Address the next `createProxy` deploys to.
    pub fn set_next_proxy(&self, address: &str) {
        lock(&self.state).next_proxy = Some(normalize_address(address));
    }

    /// Make every call revert with `reason` until cleared.
    pub fn set_revert(&self, reason: Option<&str>) {
        lock(&self.state).revert_reason = reason.map(str::to_string);
    }

    pub fn insert_escrow(&self, address: &str, escrow: SimulatedEscrow) {
        lock(&self.state)
            .escrows
            .insert(normalize_address(address), escrow);
    }

    pub fn escrow(&self, address: &str) -> Option<SimulatedEscrow> {
        lock(&self.state).escrows.get(&normalize_address(address)).cloned()
    }

    pub fn set_asset_uri(&self, address: &str, uri: &str) -> bool {
        match lock(&self.state).escrows.get_mut(&normalize_address(address)) {
            Some(escrow) => {
                escrow.asset_uri = uri.to_string();
                true
            }
            None => false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn predicted_proxy(&self, state: &ChainState) -> String {
        if let Some(address) = &state.next_proxy {
            return address.clone();
        }
        let mut seed = self.factory.as_bytes().to_vec();
        seed.extend_from_slice(&state.nonce.to_be_bytes());
        to_hex_prefixed(&keccak256(&seed)[12..])
    }

    /// Execute without side effects; returns the encoded output.
    fn execute(&self, state: &ChainState, from: Option<&str>, to: &str, data: &[u8]) -> EscrowResult<Vec<u8>> {
        if let Some(reason) = &state.revert_reason {
            return Err(revert(reason));
        }
        let to = normalize_address(to);

        if to == self.factory {
            let function = self
                .factory_abi
                .function_for_calldata(data)
                .ok_or_else(|| revert("unknown factory selector"))?;
            let args = function.decode_input(data)?;
            return match function.name.as_str() {
                "createProxy" => {
                    let signer = args.get(1).and_then(value_address).unwrap_or_default();
                    let judge = args.get(2).and_then(value_address).unwrap_or_default();
                    if signer == judge {
                        return Err(revert("signer and judge must differ"));
                    }
                    function.encode_output(&[address_value(&self.predicted_proxy(state))?])
                }
                "implementation" => function.encode_output(&[address_value(&self.factory)?]),
                other => Err(revert(&format!("{} not supported", other))),
            };
        }

        let escrow = state
            .escrows
            .get(&to)
            .ok_or_else(|| revert(&format!("no contract at {}", to)))?;
        let function = self
            .escrow_abi
            .function_for_calldata(data)
            .ok_or_else(|| revert("unknown escrow selector"))?;

        let outputs = match function.name.as_str() {
            "approve" => {
                let caller = from.map(normalize_address).unwrap_or_default();
                if caller != escrow.judge {
                    return Err(revert("caller is not the judge"));
                }
                if escrow.status != EscrowStatus::WaitingForJudge {
                    return Err(revert("escrow is not waiting for judge"));
                }
                Vec::new()
            }
            "payer" => vec![address_value(&escrow.payer)?],
            "beneficiary" => vec![address_value(&escrow.beneficiary)?],
            "judge" => vec![address_value(&escrow.judge)?],
            "status" => vec![DynSolValue::Uint(U256::from(escrow.status.code()), 8)],
            "approvedBalance" => vec![DynSolValue::Uint(escrow.approved_balance, 256)],
            "assetURI" => vec![DynSolValue::String(escrow.asset_uri.clone())],
            other => return Err(revert(&format!("{} not supported", other))),
        };
        function.encode_output(&outputs)
    }

    /// Apply a mined transaction; returns the logs it emits.
    fn apply(&self, state: &mut ChainState, to: &str, data: &[u8]) -> EscrowResult<Vec<LogEntry>> {
        let to = normalize_address(to);
        if to == self.factory {
            let function = self
                .factory_abi
                .function_for_calldata(data)
                .ok_or_else(|| revert("unknown factory selector"))?;
            if function.name != "createProxy" {
                return Ok(Vec::new());
            }
            let args = function.decode_input(data)?;
            let address = self.predicted_proxy(state);
            let field = |index: usize| args.get(index).and_then(value_address).unwrap_or_default();
            let escrow = SimulatedEscrow {
                payer: field(0),
                beneficiary: field(1),
                judge: field(2),
                status: EscrowStatus::WaitingForJudge,
                approved_balance: U256::ZERO,
                asset_uri: String::new(),
            };
            let created = log_entry(
                &self.factory_abi,
                &self.factory,
                "ProxyCreated",
                &[address_value(&address)?, address_value(&escrow.payer)?],
            )?;
            debug!(proxy = %address, payer = %escrow.payer, "simulated escrow deployed");
            state.escrows.insert(address, escrow);
            state.next_proxy = None;
            return Ok(vec![created]);
        }

        let approving =
            self.escrow_abi.function_for_calldata(data).map(|f| f.name.as_str()) == Some("approve");
        match state.escrows.get_mut(&to) {
            Some(escrow) if approving => {
                escrow.status = EscrowStatus::Processing;
                let judge = address_value(&escrow.judge)?;
                Ok(vec![log_entry(&self.escrow_abi, &to, "Approved", &[judge])?])
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn log_entry(
    abi: &AbiDescriptor,
    address: &str,
    event: &str,
    values: &[DynSolValue],
) -> EscrowResult<LogEntry> {
    let (topics, data) = abi.encode_log(event, values)?;
    Ok(LogEntry {
        address: address.to_string(),
        topics,
        data,
    })
}

fn revert(reason: &str) -> EscrowError {
    EscrowError::call(CallErrorKind::Reverted, format!("execution reverted: {}", reason))
}

#[async_trait]
impl ContractTransport for SimulatedEscrowChain {
    fn transport_id(&self) -> &'static str {
        "simulated"
    }

    async fn call(&self, from: Option<&str>, to: &str, data: &[u8]) -> EscrowResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        self.execute(&state, from, to, data)
    }

    async fn send_transaction(&self, from: &str, to: &str, data: &[u8]) -> EscrowResult<String> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        self.execute(&state, Some(from), to, data)?;
        let logs = self.apply(&mut state, to, data)?;

        let mut seed = Vec::with_capacity(data.len() + 48);
        seed.extend_from_slice(from.as_bytes());
        seed.extend_from_slice(to.as_bytes());
        seed.extend_from_slice(data);
        seed.extend_from_slice(&state.nonce.to_be_bytes());
        let hash = to_hex_prefixed(&keccak256(&seed));

        state.nonce += 1;
        state.block += 1;
        let receipt = TransactionReceipt {
            transaction_hash: hash.clone(),
            block_number: Some(state.block),
            success: true,
            logs,
        };
        state.receipts.insert(hash.clone(), receipt);
        Ok(hash)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> EscrowResult<Option<TransactionReceipt>> {
        Ok(lock(&self.state).receipts.get(tx_hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY: &str = "0x00000000000000000000000000000000000fac70";
    const PAYER: &str = "0x1230000000000000000000000000000000000123";
    const SIGNER: &str = "0xabc0000000000000000000000000000000000abc";
    const JUDGE: &str = "0xdef0000000000000000000000000000000000def";

    fn create_calldata(signer: &str, judge: &str) -> Vec<u8> {
        AbiDescriptor::escrow_factory()
            .unwrap()
            .function("createProxy")
            .unwrap()
            .encode_call(&[
                address_value(PAYER).unwrap(),
                address_value(signer).unwrap(),
                address_value(judge).unwrap(),
            ])
            .unwrap()
    }

    #[tokio::test]
    async fn identical_content_yields_identical_uri() {
        let store = InMemoryContentStore::new();
        let file = AssetFile::new("a.pdf", "application/pdf", b"terms".to_vec());
        let meta = UploadMetadata::default();

        let first = store.store(&meta, &file).await.unwrap();
        let second = store.store(&meta, &file).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.get(&first.url), Some(b"terms".to_vec()));

        let other = AssetFile::new("a.pdf", "application/pdf", b"other".to_vec());
        assert_ne!(store.store(&meta, &other).await.unwrap(), first);
    }

    #[tokio::test]
    async fn flaky_store_recovers() {
        let store = FlakyContentStore::new(2);
        let file = AssetFile::new("a.pdf", "application/pdf", b"terms".to_vec());
        let meta = UploadMetadata::default();

        assert!(store.store(&meta, &file).await.unwrap_err().is_transient());
        assert!(store.store(&meta, &file).await.is_err());
        assert!(store.store(&meta, &file).await.is_ok());
        assert_eq!(store.attempts(), 3);
    }

    #[tokio::test]
    async fn simulated_factory_deploys_escrows() {
        let chain = SimulatedEscrowChain::new(FACTORY).unwrap();
        chain.set_next_proxy("0x9e3f000000000000000000000000000000000EA0");
        let data = create_calldata(SIGNER, JUDGE);

        let simulated = chain.call(Some(PAYER), FACTORY, &data).await.unwrap();
        assert_eq!(simulated.len(), 32);
        assert_eq!(chain.escrow("0x9e3f000000000000000000000000000000000ea0"), None);

        let hash = chain.send_transaction(PAYER, FACTORY, &data).await.unwrap();
        let receipt = chain.transaction_receipt(&hash).await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].address, FACTORY);
        let factory_abi = AbiDescriptor::escrow_factory().unwrap();
        let created = factory_abi
            .decode_log("ProxyCreated", &receipt.logs[0].topics, &receipt.logs[0].data)
            .unwrap();
        assert_eq!(
            value_address(&created[0]).as_deref(),
            Some("0x9e3f000000000000000000000000000000000ea0")
        );
        assert_eq!(value_address(&created[1]).as_deref(), Some(PAYER));

        let escrow = chain.escrow("0x9e3f000000000000000000000000000000000ea0").unwrap();
        assert_eq!(escrow.payer, PAYER);
        assert_eq!(escrow.beneficiary, SIGNER);
        assert_eq!(escrow.judge, JUDGE);
        assert_eq!(escrow.status, EscrowStatus::WaitingForJudge);
    }

    #[tokio::test]
    async fn proxies_are_deterministic_without_script() {
        let first = SimulatedEscrowChain::new(FACTORY).unwrap();
        let second = SimulatedEscrowChain::new(FACTORY).unwrap();
        let data = create_calldata(SIGNER, JUDGE);

        assert_eq!(
            first.call(Some(PAYER), FACTORY, &data).await.unwrap(),
            second.call(Some(PAYER), FACTORY, &data).await.unwrap()
        );
    }

    #[tokio::test]
    async fn same_signer_and_judge_reverts() {
        let chain = SimulatedEscrowChain::new(FACTORY).unwrap();
        let err = chain
            .send_transaction(PAYER, FACTORY, &create_calldata(SIGNER, SIGNER))
            .await
            .unwrap_err();
        assert_eq!(err.call_kind(), Some(CallErrorKind::Reverted));
        assert_eq!(err.message(), "execution reverted: signer and judge must differ");
    }

    #[tokio::test]
    async fn only_the_judge_can_approve() {
        let chain = SimulatedEscrowChain::new(FACTORY).unwrap();
        let escrow = "0x0000000000000000000000000000000000000e5c";
        chain.insert_escrow(
            escrow,
            SimulatedEscrow {
                payer: PAYER.to_string(),
                beneficiary: SIGNER.to_string(),
                judge: JUDGE.to_string(),
                status: EscrowStatus::WaitingForJudge,
                approved_balance: U256::from(10u8),
                asset_uri: "ipfs://xyz".to_string(),
            },
        );
        let approve = AbiDescriptor::escrow()
            .unwrap()
            .function("approve")
            .unwrap()
            .encode_call(&[])
            .unwrap();

        assert!(chain.send_transaction(PAYER, escrow, &approve).await.is_err());
        chain.send_transaction(JUDGE, escrow, &approve).await.unwrap();
        assert_eq!(chain.escrow(escrow).unwrap().status, EscrowStatus::Processing);

        // A second approval reverts.
        assert!(chain.call(Some(JUDGE), escrow, &approve).await.is_err());
    }

    #[tokio::test]
    async fn rejecting_wallet_reports_connection_error() {
        let err = RejectingWalletProvider::default()
            .request_accounts(137)
            .await
            .unwrap_err();
        assert_eq!(err.name(), "ConnectionError");
    }
}
