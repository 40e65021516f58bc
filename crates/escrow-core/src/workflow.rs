//! Escrow creation workflow.
//!
//! Drives the create page: wallet connection, asset upload, signer and judge
//! entry, then a `createProxy` write to the escrow factory. The stage is
//! derived from the sub-states, so the asset step and the address steps can
//! progress in any order.

use crate::abi::{address_value, value_address, AbiDescriptor};
use crate::error::{CallErrorKind, EscrowError, EscrowResult};
use crate::gateway::{ContractCallGateway, ContractCallRequest};
use crate::notify::NotificationCenter;
use crate::types::{
    explorer_code_url, is_address, normalize_address, CallFailure, CallReceipt, CreatedEscrow,
    EscrowCreationDraft, TransactionOutcome, UploadResult,
};
use crate::uploader::{AssetFile, AssetUploader};
use crate::wallet::WalletSession;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Factory function that deploys a new escrow instance.
pub const CREATE_FUNCTION: &str = "createProxy";

/// Factory event announcing a deployed escrow: `(proxy, payer)`.
pub const CREATED_EVENT: &str = "ProxyCreated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Empty,
    WalletPending,
    WalletConnected,
    AssetUploading,
    AssetReady,
    FormComplete,
    Submitting,
    Created,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub chain_id: u64,
    pub factory_address: String,
    pub explorer_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Created,
    Failed,
}

#[derive(Debug, Default)]
struct WorkflowState {
    /// Bumped by `reset`; submissions started under an older value are stale.
    generation: u64,
    /// Bumped per upload start; only the latest upload may land.
    asset_ticket: u64,
    wallet_requested: bool,
    uploading: bool,
    submitting: bool,
    draft: EscrowCreationDraft,
    terminal: Option<Terminal>,
    created: Option<CreatedEscrow>,
    last_failure: Option<CallFailure>,
}

impl WorkflowState {
    fn stage(&self, wallet_connected: bool) -> WorkflowStage {
        if self.submitting {
            return WorkflowStage::Submitting;
        }
        match self.terminal {
            Some(Terminal::Created) => return WorkflowStage::Created,
            Some(Terminal::Failed) => return WorkflowStage::Failed,
            None => {}
        }
        if !wallet_connected {
            return if self.wallet_requested {
                WorkflowStage::WalletPending
            } else {
                WorkflowStage::Empty
            };
        }
        if self.uploading {
            WorkflowStage::AssetUploading
        } else if self.draft.has_addresses() {
            WorkflowStage::FormComplete
        } else if self.draft.contract_asset_uri.is_some() {
            WorkflowStage::AssetReady
        } else {
            WorkflowStage::WalletConnected
        }
    }
}

/// View-model of the escrow creation page.
pub struct EscrowCreationWorkflow {
    wallet: Arc<WalletSession>,
    uploader: Arc<AssetUploader>,
    gateway: Arc<ContractCallGateway>,
    notifications: Arc<NotificationCenter>,
    factory_abi: Arc<AbiDescriptor>,
    settings: WorkflowSettings,
    state: Mutex<WorkflowState>,
}

impl EscrowCreationWorkflow {
    pub fn new(
        wallet: Arc<WalletSession>,
        uploader: Arc<AssetUploader>,
        gateway: Arc<ContractCallGateway>,
        notifications: Arc<NotificationCenter>,
        mut settings: WorkflowSettings,
    ) -> EscrowResult<Self> {
        if !is_address(&settings.factory_address) {
            return Err(EscrowError::Config(format!(
                "factory address '{}' is not a 20-byte hex address",
                settings.factory_address
            )));
        }
        settings.factory_address = normalize_address(&settings.factory_address);

        let factory_abi = Arc::new(AbiDescriptor::escrow_factory()?);
        factory_abi.function(CREATE_FUNCTION)?;
        factory_abi.event(CREATED_EVENT)?;

        Ok(Self {
            wallet,
            uploader,
            gateway,
            notifications,
            factory_abi,
            settings,
            state: Mutex::new(WorkflowState::default()),
        })
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn stage(&self) -> WorkflowStage {
        let connected = self.wallet.is_connected();
        self.lock().stage(connected)
    }

    pub fn draft(&self) -> EscrowCreationDraft {
        self.lock().draft.clone()
    }

    /// Escrow created by the last successful submission.
    pub fn created(&self) -> Option<CreatedEscrow> {
        self.lock().created.clone()
    }

    pub fn last_failure(&self) -> Option<CallFailure> {
        self.lock().last_failure.clone()
    }

    pub fn is_submitting(&self) -> bool {
        self.lock().submitting
    }

    pub async fn connect_wallet(&self) -> EscrowResult<String> {
        self.lock().wallet_requested = true;

        match self.wallet.connect(self.settings.chain_id).await {
            Ok(address) => {
                debug!(stage = ?self.stage(), "wallet step complete");
                Ok(address)
            }
            Err(err) => {
                self.notifications.error(&err);
                Err(err)
            }
        }
    }

    pub async fn disconnect_wallet(&self) -> EscrowResult<()> {
        self.lock().wallet_requested = false;
        self.wallet.disconnect().await.map_err(|err| {
            self.notifications.error(&err);
            err
        })
    }

    /// Upload the contract asset and record its URI in the draft.
    ///
    /// The previous URI stays in the draft until the new upload succeeds. A
    /// newer upload, [`cancel_upload`](Self::cancel_upload) or
    /// [`reset`](Self::reset) supersedes this one; a superseded result is
    /// returned as an error and never touches the draft.
    pub async fn upload_asset(&self, file: AssetFile) -> EscrowResult<UploadResult> {
        let ticket = {
            let mut state = self.lock();
            state.asset_ticket += 1;
            state.uploading = true;
            state.terminal = None;
            state.asset_ticket
        };
        debug!(file = %file.file_name, ticket, "asset upload started");

        let result = self.uploader.upload(&file).await;

        let mut state = self.lock();
        if state.asset_ticket != ticket {
            drop(state);
            debug!(file = %file.file_name, ticket, "discarding superseded upload");
            return Err(EscrowError::upload_rejected(
                "upload superseded by a newer asset or a reset",
            ));
        }
        state.uploading = false;

        match result {
            Ok(upload) => {
                state.draft.contract_asset_uri = Some(upload.content_uri.clone());
                drop(state);
                info!(uri = %upload.content_uri, "contract asset ready");
                Ok(upload)
            }
            Err(err) => {
                drop(state);
                self.notifications.error(&err);
                Err(err)
            }
        }
    }

    /// Invalidate the in-flight upload, if any.
    pub fn cancel_upload(&self) -> bool {
        let mut state = self.lock();
        if !state.uploading {
            return false;
        }
        state.asset_ticket += 1;
        state.uploading = false;
        true
    }

    pub fn set_signer_address(&self, value: impl Into<String>) {
        let mut state = self.lock();
        state.draft.signer_address = value.into();
        state.terminal = None;
    }

    pub fn set_judge_address(&self, value: impl Into<String>) {
        let mut state = self.lock();
        state.draft.judge_address = value.into();
        state.terminal = None;
    }

    /// Whether the submit action is enabled.
    pub fn can_submit(&self) -> bool {
        let connected = self.wallet.is_connected();
        let state = self.lock();
        connected && state.draft.has_addresses() && !state.submitting
    }

    /// Check the submission preconditions without submitting.
    pub fn validate(&self) -> EscrowResult<()> {
        let draft = self.draft();
        self.check_submission(&draft).map(|_| ())
    }

    /// Submit the draft to the escrow factory.
    ///
    /// On failure the draft is left untouched and the error is kept verbatim
    /// in [`last_failure`](Self::last_failure); the draft can be resubmitted.
    pub async fn submit(&self) -> EscrowResult<CreatedEscrow> {
        let (caller, draft, generation) = match self.begin_submit() {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(error = %err, "escrow submission blocked");
                self.notifications.error(&err);
                return Err(err);
            }
        };
        info!(
            caller = %caller,
            signer = %draft.signer_address,
            judge = %draft.judge_address,
            "submitting escrow creation"
        );

        let outcome = match self.create_request(&caller, &draft) {
            Ok(request) => self.gateway.call(Some(&caller), &request).await,
            Err(err) => TransactionOutcome::Error(CallFailure::from(&err)),
        };

        let result = match outcome {
            TransactionOutcome::Success(receipt) => match self.created_address(&receipt, &caller) {
                Ok(address) => Ok(CreatedEscrow {
                    explorer_url: explorer_code_url(&self.settings.explorer_host, &address),
                    contract_address: address,
                    asset_uri: draft.contract_asset_uri.clone(),
                    transaction_hash: receipt.transaction_hash.clone(),
                }),
                Err(err) => Err(CallFailure::from(err)),
            },
            TransactionOutcome::Error(failure) => Err(failure),
            TransactionOutcome::Pending => Err(CallFailure::from(EscrowError::call(
                CallErrorKind::Rpc,
                "call ended without an outcome",
            ))),
        };

        self.finish_submit(generation, result)
    }

    /// Abandon the form. Late upload or submission results are discarded.
    pub fn reset(&self) {
        let mut state = self.lock();
        let next = WorkflowState {
            generation: state.generation + 1,
            asset_ticket: state.asset_ticket + 1,
            wallet_requested: state.wallet_requested,
            ..WorkflowState::default()
        };
        *state = next;
        debug!("escrow creation form reset");
    }

    fn check_submission(&self, draft: &EscrowCreationDraft) -> EscrowResult<String> {
        let caller = self.wallet.require_address()?;
        if let Some(field) = draft.missing_fields().first() {
            return Err(EscrowError::missing_field(field));
        }
        for (field, value) in [
            ("signer_address", &draft.signer_address),
            ("judge_address", &draft.judge_address),
        ] {
            if !is_address(value.trim()) {
                return Err(EscrowError::Validation(format!(
                    "'{}' is not a valid address: '{}'",
                    field, value
                )));
            }
        }
        Ok(caller)
    }

    fn begin_submit(&self) -> EscrowResult<(String, EscrowCreationDraft, u64)> {
        let mut state = self.lock();
        if state.submitting {
            return Err(EscrowError::Validation(
                "an escrow submission is already in progress".to_string(),
            ));
        }
        let caller = self.check_submission(&state.draft)?;
        state.submitting = true;
        state.terminal = None;
        Ok((caller, state.draft.clone(), state.generation))
    }

    fn create_request(
        &self,
        caller: &str,
        draft: &EscrowCreationDraft,
    ) -> EscrowResult<ContractCallRequest> {
        ContractCallRequest::new(
            &self.settings.factory_address,
            Arc::clone(&self.factory_abi),
            CREATE_FUNCTION,
            vec![
                address_value(caller)?,
                address_value(draft.signer_address.trim())?,
                address_value(draft.judge_address.trim())?,
            ],
        )
    }

    /// Address of the escrow this transaction deployed for `caller`, taken
    /// from the factory's `ProxyCreated` log in the mined receipt.
    fn created_address(&self, receipt: &CallReceipt, caller: &str) -> EscrowResult<String> {
        let caller = normalize_address(caller);
        let mined = receipt
            .logs_from(&self.settings.factory_address)
            .filter_map(|log| {
                self.factory_abi
                    .decode_log(CREATED_EVENT, &log.topics, &log.data)
                    .ok()
            })
            .find_map(|values| {
                let proxy = values.first().and_then(value_address)?;
                let payer = values.get(1).and_then(value_address)?;
                (payer == caller).then_some(proxy)
            });

        let tx_hash = receipt.transaction_hash.as_deref().unwrap_or("-");
        let address = mined.ok_or_else(|| {
            EscrowError::call(
                CallErrorKind::Encoding,
                format!(
                    "transaction {} has no {} log for {}",
                    tx_hash, CREATED_EVENT, caller
                ),
            )
        })?;

        let simulated = receipt.return_values.first().and_then(value_address);
        if simulated.as_deref() != Some(address.as_str()) {
            warn!(
                tx_hash,
                simulated = simulated.as_deref().unwrap_or("-"),
                mined = %address,
                "mined escrow address differs from simulation"
            );
        }
        Ok(address)
    }

    fn finish_submit(
        &self,
        generation: u64,
        result: Result<CreatedEscrow, CallFailure>,
    ) -> EscrowResult<CreatedEscrow> {
        let mut state = self.lock();
        if state.generation != generation {
            drop(state);
            warn!("form reset during submission; outcome not applied to the form");
            return match result {
                Ok(created) => {
                    self.announce_created(&created);
                    Ok(created)
                }
                Err(failure) => {
                    self.notifications.failure(&failure);
                    Err(EscrowError::from(failure))
                }
            };
        }

        state.submitting = false;
        match result {
            Ok(created) => {
                state.draft = EscrowCreationDraft::default();
                state.asset_ticket += 1;
                state.uploading = false;
                state.created = Some(created.clone());
                state.last_failure = None;
                state.terminal = Some(Terminal::Created);
                drop(state);

                info!(
                    contract = %created.contract_address,
                    tx_hash = created.transaction_hash.as_deref().unwrap_or("-"),
                    "escrow created"
                );
                self.announce_created(&created);
                Ok(created)
            }
            Err(failure) => {
                state.last_failure = Some(failure.clone());
                state.terminal = Some(Terminal::Failed);
                drop(state);

                warn!(error = %failure, "escrow creation failed");
                self.notifications.failure(&failure);
                Err(EscrowError::from(failure))
            }
        }
    }

    fn announce_created(&self, created: &CreatedEscrow) {
        let message = match &created.asset_uri {
            Some(uri) => format!("{} (asset {})", created.contract_address, uri),
            None => created.contract_address.clone(),
        };
        self.notifications.success("Escrow created", message);
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::FunctionCodec;
    use crate::gateway::{ContractTransport, GatewayConfig, TransactionReceipt};
    use crate::types::LogEntry;
    use crate::notify::NotificationLevel;
    use crate::uploader::{ContentStore, RetryPolicy, StoredContent, UploadMetadata};
    use crate::wallet::WalletProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const FACTORY: &str = "0x00000000000000000000000000000000000fac70";
    const CALLER: &str = "0x1230000000000000000000000000000000000123";
    const SIGNER: &str = "0xabc0000000000000000000000000000000000abc";
    const JUDGE: &str = "0xdef0000000000000000000000000000000000def";
    const PROXY: &str = "0x9e3f000000000000000000000000000000000ea0";
    const OTHER_PROXY: &str = "0x5150000000000000000000000000000000000515";

    struct Wallet(Option<&'static str>);

    #[async_trait]
    impl WalletProvider for Wallet {
        fn provider_id(&self) -> &'static str {
            "test"
        }

        async fn request_accounts(&self, _chain_id: u64) -> EscrowResult<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| EscrowError::Connection("no injected wallet found".into()))
        }
    }

    #[derive(Default)]
    struct Store {
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ContentStore for Store {
        fn store_id(&self) -> &'static str {
            "test"
        }

        async fn store(&self, _meta: &UploadMetadata, file: &AssetFile) -> EscrowResult<StoredContent> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(StoredContent {
                url: format!("ipfs://{}", file.file_name),
            })
        }
    }

    #[derive(Default)]
    struct Chain {
        revert: AtomicBool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        /// Proxy named by the mined log; `PROXY` when unset.
        mined_proxy: Option<&'static str>,
        omit_log: bool,
    }

    #[async_trait]
    impl ContractTransport for Chain {
        fn transport_id(&self) -> &'static str {
            "test"
        }

        async fn call(&self, _from: Option<&str>, _to: &str, _data: &[u8]) -> EscrowResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.revert.load(Ordering::SeqCst) {
                return Err(EscrowError::call(
                    CallErrorKind::Reverted,
                    "execution reverted: signer equals judge",
                ));
            }
            AbiDescriptor::escrow_factory()?
                .function(CREATE_FUNCTION)?
                .encode_output(&[address_value(PROXY)?])
        }

        async fn send_transaction(&self, _from: &str, _to: &str, _data: &[u8]) -> EscrowResult<String> {
            Ok("0xbeef".to_string())
        }

        async fn transaction_receipt(&self, tx_hash: &str) -> EscrowResult<Option<TransactionReceipt>> {
            let mut logs = Vec::new();
            if !self.omit_log {
                let proxy = self.mined_proxy.unwrap_or(PROXY);
                let (topics, data) = AbiDescriptor::escrow_factory()?.encode_log(
                    CREATED_EVENT,
                    &[address_value(proxy)?, address_value(CALLER)?],
                )?;
                logs.push(LogEntry {
                    address: FACTORY.to_string(),
                    topics,
                    data,
                });
            }
            Ok(Some(TransactionReceipt {
                transaction_hash: tx_hash.to_string(),
                block_number: Some(7),
                success: true,
                logs,
            }))
        }
    }

    struct Harness {
        workflow: Arc<EscrowCreationWorkflow>,
        chain: Arc<Chain>,
        notifications: Arc<NotificationCenter>,
    }

    fn harness(account: Option<&'static str>, store: Store, chain: Chain) -> Harness {
        let chain = Arc::new(chain);
        let notifications = Arc::new(NotificationCenter::new());
        let gateway = Arc::new(ContractCallGateway::new(
            chain.clone(),
            GatewayConfig {
                read_timeout: Duration::from_secs(5),
                receipt_timeout: Duration::from_secs(5),
                receipt_poll_interval: Duration::from_millis(10),
            },
        ));
        let uploader = Arc::new(AssetUploader::new(
            Arc::new(store),
            UploadMetadata::default(),
            RetryPolicy::none(),
        ));
        let workflow = EscrowCreationWorkflow::new(
            Arc::new(WalletSession::new(Arc::new(Wallet(account)))),
            uploader,
            gateway,
            notifications.clone(),
            WorkflowSettings {
                chain_id: 137,
                factory_address: FACTORY.to_string(),
                explorer_host: "polygonscan.com".to_string(),
            },
        )
        .unwrap();

        Harness {
            workflow: Arc::new(workflow),
            chain,
            notifications,
        }
    }

    fn asset() -> AssetFile {
        AssetFile::new("xyz", "application/pdf", b"terms".to_vec())
    }

    #[tokio::test]
    async fn happy_path_walks_the_stages() {
        let h = harness(Some(CALLER), Store::default(), Chain::default());
        let workflow = &h.workflow;
        assert_eq!(workflow.stage(), WorkflowStage::Empty);

        workflow.connect_wallet().await.unwrap();
        assert_eq!(workflow.stage(), WorkflowStage::WalletConnected);

        workflow.upload_asset(asset()).await.unwrap();
        assert_eq!(workflow.stage(), WorkflowStage::AssetReady);

        workflow.set_signer_address(SIGNER);
        workflow.set_judge_address(JUDGE);
        assert_eq!(workflow.stage(), WorkflowStage::FormComplete);
        assert!(workflow.can_submit());

        let created = workflow.submit().await.unwrap();
        assert_eq!(created.contract_address, PROXY);
        assert_eq!(created.asset_uri.as_deref(), Some("ipfs://xyz"));
        assert_eq!(
            created.explorer_url,
            format!("https://polygonscan.com/address/{}#code", PROXY)
        );
        assert_eq!(workflow.stage(), WorkflowStage::Created);
        assert_eq!(workflow.created(), Some(created));
        assert_eq!(workflow.draft(), EscrowCreationDraft::default());

        let latest = h.notifications.latest().unwrap();
        assert_eq!(latest.level, NotificationLevel::Success);
        assert!(latest.message.contains(PROXY));
    }

    #[tokio::test]
    async fn submission_is_blocked_until_preconditions_hold() {
        let h = harness(Some(CALLER), Store::default(), Chain::default());
        let workflow = &h.workflow;

        // Disconnected wallet.
        workflow.set_signer_address(SIGNER);
        workflow.set_judge_address(JUDGE);
        assert!(!workflow.can_submit());
        assert_eq!(workflow.submit().await.unwrap_err().name(), "ValidationError");

        // Connected, missing judge.
        workflow.connect_wallet().await.unwrap();
        workflow.set_judge_address("");
        assert!(!workflow.can_submit());
        assert_eq!(workflow.submit().await.unwrap_err().name(), "ValidationError");

        // Connected, malformed signer.
        workflow.set_signer_address("0xABC...");
        workflow.set_judge_address(JUDGE);
        assert!(workflow.can_submit());
        assert!(workflow.validate().is_err());
        assert!(workflow.submit().await.is_err());

        assert_eq!(h.chain.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.notifications.active().len(), 3);
    }

    #[tokio::test]
    async fn failed_write_keeps_draft_and_allows_resubmission() {
        let chain = Chain::default();
        chain.revert.store(true, Ordering::SeqCst);
        let h = harness(Some(CALLER), Store::default(), chain);
        let workflow = &h.workflow;

        workflow.connect_wallet().await.unwrap();
        workflow.upload_asset(asset()).await.unwrap();
        workflow.set_signer_address(SIGNER);
        workflow.set_judge_address(JUDGE);
        let before = workflow.draft();

        let err = workflow.submit().await.unwrap_err();
        assert_eq!(err.call_kind(), Some(CallErrorKind::Reverted));
        assert_eq!(workflow.stage(), WorkflowStage::Failed);
        assert_eq!(workflow.draft(), before);

        let failure = workflow.last_failure().unwrap();
        assert_eq!(failure.name, "ContractRevertError");
        assert_eq!(failure.message, "execution reverted: signer equals judge");
        assert_eq!(h.notifications.latest().unwrap().title, "ContractRevertError");

        h.chain.revert.store(false, Ordering::SeqCst);
        workflow.submit().await.unwrap();
        assert_eq!(workflow.stage(), WorkflowStage::Created);
    }

    #[tokio::test]
    async fn created_address_comes_from_the_mined_log() {
        let chain = Chain {
            mined_proxy: Some(OTHER_PROXY),
            ..Chain::default()
        };
        let h = harness(Some(CALLER), Store::default(), chain);
        h.workflow.connect_wallet().await.unwrap();
        h.workflow.set_signer_address(SIGNER);
        h.workflow.set_judge_address(JUDGE);

        let created = h.workflow.submit().await.unwrap();
        assert_eq!(created.contract_address, OTHER_PROXY);
        assert!(created.explorer_url.contains(OTHER_PROXY));
    }

    #[tokio::test]
    async fn receipt_without_creation_log_fails() {
        let chain = Chain {
            omit_log: true,
            ..Chain::default()
        };
        let h = harness(Some(CALLER), Store::default(), chain);
        h.workflow.connect_wallet().await.unwrap();
        h.workflow.set_signer_address(SIGNER);
        h.workflow.set_judge_address(JUDGE);

        let err = h.workflow.submit().await.unwrap_err();
        assert_eq!(err.call_kind(), Some(CallErrorKind::Encoding));
        assert!(err.message().contains("0xbeef"));
        assert_eq!(h.workflow.stage(), WorkflowStage::Failed);
        assert_eq!(h.workflow.created(), None);
    }

    #[tokio::test]
    async fn failed_reupload_keeps_previous_asset() {
        let h = harness(Some(CALLER), Store::default(), Chain::default());
        h.workflow.connect_wallet().await.unwrap();
        h.workflow.upload_asset(asset()).await.unwrap();

        let empty = AssetFile::new("blank.pdf", "application/pdf", Vec::new());
        assert!(h.workflow.upload_asset(empty).await.is_err());
        assert_eq!(
            h.workflow.draft().contract_asset_uri.as_deref(),
            Some("ipfs://xyz")
        );
        assert_eq!(h.workflow.stage(), WorkflowStage::AssetReady);
    }

    #[tokio::test]
    async fn wallet_failure_stays_pending() {
        let h = harness(None, Store::default(), Chain::default());
        let err = h.workflow.connect_wallet().await.unwrap_err();
        assert_eq!(err.name(), "ConnectionError");
        assert_eq!(h.workflow.stage(), WorkflowStage::WalletPending);
        assert_eq!(h.notifications.latest().unwrap().title, "ConnectionError");
    }

    #[tokio::test]
    async fn reset_discards_late_upload() {
        let gate = Arc::new(Notify::new());
        let store = Store {
            gate: Some(gate.clone()),
        };
        let h = harness(Some(CALLER), store, Chain::default());
        h.workflow.connect_wallet().await.unwrap();

        let workflow = h.workflow.clone();
        let upload = tokio::spawn(async move { workflow.upload_asset(asset()).await });
        while h.workflow.stage() != WorkflowStage::AssetUploading {
            tokio::task::yield_now().await;
        }

        h.workflow.reset();
        gate.notify_one();

        assert!(upload.await.unwrap().is_err());
        assert_eq!(h.workflow.draft().contract_asset_uri, None);
        assert_eq!(h.workflow.stage(), WorkflowStage::WalletConnected);
    }

    #[tokio::test]
    async fn second_submit_while_in_flight_is_refused() {
        let gate = Arc::new(Notify::new());
        let chain = Chain {
            gate: Some(gate.clone()),
            ..Chain::default()
        };
        let h = harness(Some(CALLER), Store::default(), chain);
        h.workflow.connect_wallet().await.unwrap();
        h.workflow.set_signer_address(SIGNER);
        h.workflow.set_judge_address(JUDGE);

        let workflow = h.workflow.clone();
        let first = tokio::spawn(async move { workflow.submit().await });
        while h.workflow.stage() != WorkflowStage::Submitting {
            tokio::task::yield_now().await;
        }
        assert!(!h.workflow.can_submit());

        let err = h.workflow.submit().await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(h.chain.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_malformed_factory() {
        let result = EscrowCreationWorkflow::new(
            Arc::new(WalletSession::new(Arc::new(Wallet(None)))),
            Arc::new(AssetUploader::new(
                Arc::new(Store::default()),
                UploadMetadata::default(),
                RetryPolicy::none(),
            )),
            Arc::new(ContractCallGateway::new(
                Arc::new(Chain::default()),
                GatewayConfig::default(),
            )),
            Arc::new(NotificationCenter::new()),
            WorkflowSettings {
                chain_id: 137,
                factory_address: "factory".to_string(),
                explorer_host: "polygonscan.com".to_string(),
            },
        );
        assert!(matches!(result, Err(EscrowError::Config(_))));
    }
}
