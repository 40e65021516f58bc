//! Judge dashboard: escrow records filtered by status tab.

use crate::abi::{value_address, value_uint, AbiDescriptor};
use crate::error::{CallErrorKind, EscrowError, EscrowResult};
use crate::gateway::{ContractCallGateway, ContractCallRequest};
use crate::notify::NotificationCenter;
use crate::types::{
    format_token_amount, is_address, normalize_address, EscrowRecord, EscrowStatus,
    TransactionOutcome,
};
use crate::wallet::WalletSession;
use alloy_dyn_abi::DynSolValue;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

const APPROVE_FUNCTION: &str = "approve";

/// Number of records per status tab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting_for_judge: usize,
    pub processing: usize,
    pub completed: usize,
}

impl StatusCounts {
    pub fn get(&self, status: EscrowStatus) -> usize {
        match status {
            EscrowStatus::WaitingForJudge => self.waiting_for_judge,
            EscrowStatus::Processing => self.processing,
            EscrowStatus::Completed => self.completed,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting_for_judge + self.processing + self.completed
    }
}

/// Records matching one filter, taken from a snapshot of the board.
///
/// Iteration is lazy and can be restarted any number of times; later
/// changes to the board do not affect an existing view.
#[derive(Debug, Clone)]
pub struct VisibleRecords {
    records: Arc<Vec<EscrowRecord>>,
    filter: EscrowStatus,
}

impl VisibleRecords {
    pub fn filter(&self) -> EscrowStatus {
        self.filter
    }

    pub fn iter(&self) -> VisibleIter<'_> {
        VisibleIter {
            inner: self.records.iter(),
            filter: self.filter,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<EscrowRecord> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a VisibleRecords {
    type Item = &'a EscrowRecord;
    type IntoIter = VisibleIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct VisibleIter<'a> {
    inner: std::slice::Iter<'a, EscrowRecord>,
    filter: EscrowStatus,
}

impl<'a> Iterator for VisibleIter<'a> {
    type Item = &'a EscrowRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.inner.find(|record| record.status == filter)
    }
}

/// A judge approval whose transaction was mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReceipt {
    pub contract_address: String,
    pub transaction_hash: Option<String>,
    /// Status read back after mining. `None` when the read failed; the record
    /// is then marked `needs_refresh`.
    pub status: Option<EscrowStatus>,
}

struct BoardState {
    records: Arc<Vec<EscrowRecord>>,
    active_filter: EscrowStatus,
    approving: HashSet<String>,
}

/// View-model of the judge page.
pub struct EscrowBoard {
    gateway: Arc<ContractCallGateway>,
    wallet: Arc<WalletSession>,
    notifications: Arc<NotificationCenter>,
    escrow_abi: Arc<AbiDescriptor>,
    token_symbol: String,
    token_decimals: u32,
    state: RwLock<BoardState>,
}

impl EscrowBoard {
    pub fn new(
        gateway: Arc<ContractCallGateway>,
        wallet: Arc<WalletSession>,
        notifications: Arc<NotificationCenter>,
    ) -> EscrowResult<Self> {
        let escrow_abi = Arc::new(AbiDescriptor::escrow()?);
        escrow_abi.function(APPROVE_FUNCTION)?;

        Ok(Self {
            gateway,
            wallet,
            notifications,
            escrow_abi,
            token_symbol: "MATIC".to_string(),
            token_decimals: 18,
            state: RwLock::new(BoardState {
                records: Arc::new(Vec::new()),
                active_filter: EscrowStatus::default(),
                approving: HashSet::new(),
            }),
        })
    }

    /// Unit used to display approved balances.
    pub fn with_token(mut self, symbol: impl Into<String>, decimals: u32) -> Self {
        self.token_symbol = symbol.into();
        self.token_decimals = decimals;
        self
    }

    /// Seed the board with the static demo companies.
    pub fn with_placeholder_records(self) -> Self {
        self.write().records = Arc::new(placeholder_records());
        self
    }

    pub fn active_filter(&self) -> EscrowStatus {
        self.read().active_filter
    }

    pub fn set_filter(&self, filter: EscrowStatus) {
        self.write().active_filter = filter;
        debug!(filter = %filter, "board filter changed");
    }

    pub fn records(&self) -> Vec<EscrowRecord> {
        self.read().records.as_ref().clone()
    }

    pub fn record(&self, contract_address: &str) -> Option<EscrowRecord> {
        let key = normalize_address(contract_address);
        self.read()
            .records
            .iter()
            .find(|record| record.contract_address == key)
            .cloned()
    }

    /// Records under the active filter, in board order.
    pub fn visible_records(&self) -> VisibleRecords {
        let state = self.read();
        VisibleRecords {
            records: Arc::clone(&state.records),
            filter: state.active_filter,
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let state = self.read();
        let mut counts = StatusCounts::default();
        for record in state.records.iter() {
            match record.status {
                EscrowStatus::WaitingForJudge => counts.waiting_for_judge += 1,
                EscrowStatus::Processing => counts.processing += 1,
                EscrowStatus::Completed => counts.completed += 1,
            }
        }
        counts
    }

    /// Replace all records. Contract addresses must be unique.
    pub fn load(&self, records: Vec<EscrowRecord>) -> EscrowResult<()> {
        let mut seen = HashSet::with_capacity(records.len());
        let mut normalized = Vec::with_capacity(records.len());
        for mut record in records {
            record.contract_address = normalize_address(&record.contract_address);
            if !seen.insert(record.contract_address.clone()) {
                return Err(EscrowError::Validation(format!(
                    "duplicate escrow record for {}",
                    record.contract_address
                )));
            }
            normalized.push(record);
        }

        let count = normalized.len();
        self.write().records = Arc::new(normalized);
        debug!(count, "board records loaded");
        Ok(())
    }

    /// Rebuild the board from the given escrow instances.
    ///
    /// An escrow that cannot be read is reported and keeps its previous
    /// record, if any. Returns the number of records read from chain.
    pub async fn refresh_from_chain(&self, addresses: &[String]) -> EscrowResult<usize> {
        let previous = self.records();
        let mut records = Vec::with_capacity(addresses.len());
        let mut seen = HashSet::new();
        let mut refreshed = 0;

        for address in addresses {
            if !is_address(address) {
                let err = EscrowError::Validation(format!(
                    "escrow address '{}' is not a 20-byte hex address",
                    address
                ));
                self.notifications.error(&err);
                return Err(err);
            }
            let key = normalize_address(address);
            if !seen.insert(key.clone()) {
                continue;
            }

            let existing = previous.iter().find(|record| record.contract_address == key);
            match self.fetch_record(&key, existing.map(|record| record.name.as_str())).await {
                Ok(record) => {
                    refreshed += 1;
                    records.push(record);
                }
                Err(err) => {
                    warn!(contract = %key, error = %err, "failed to read escrow");
                    self.notifications.error(&err);
                    if let Some(record) = existing {
                        records.push(record.clone());
                    }
                }
            }
        }

        self.write().records = Arc::new(records);
        info!(refreshed, requested = addresses.len(), "board refreshed from chain");
        Ok(refreshed)
    }

    /// Approve an escrow waiting for the judge.
    ///
    /// If the transaction fails the record is left unchanged and the error is
    /// returned. Once it is mined the approval stands: the new status is read
    /// back from the contract, and if that read fails the record is marked
    /// `needs_refresh` and the read error is posted as a separate
    /// notification.
    pub async fn approve(&self, contract_address: &str) -> EscrowResult<ApprovalReceipt> {
        let key = normalize_address(contract_address);
        let caller = match self.begin_approval(&key) {
            Ok(caller) => caller,
            Err(err) => {
                self.notifications.error(&err);
                return Err(err);
            }
        };

        let transaction_hash = match self.send_approval(&caller, &key).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                self.write().approving.remove(&key);
                warn!(contract = %key, error = %err, "escrow approval failed");
                self.notifications.error(&err);
                return Err(err);
            }
        };
        let tx_label = transaction_hash.as_deref().unwrap_or("-").to_string();

        let read_back = self.read_status(&key).await;
        let status = read_back.as_ref().ok().copied();
        self.apply_approval(&key, status);

        match read_back {
            Ok(status) => {
                info!(contract = %key, tx_hash = %tx_label, status = %status, "escrow approved");
                self.notifications.success(
                    "Escrow approved",
                    format!("{} is now {} (tx {})", key, status, tx_label),
                );
            }
            Err(err) => {
                warn!(
                    contract = %key,
                    tx_hash = %tx_label,
                    error = %err,
                    "escrow approved but its status could not be read"
                );
                self.notifications.success(
                    "Escrow approved",
                    format!(
                        "{} approved in tx {}; status unknown, refresh to update",
                        key, tx_label
                    ),
                );
                self.notifications.error(&err);
            }
        }

        Ok(ApprovalReceipt {
            contract_address: key,
            transaction_hash,
            status,
        })
    }

    pub fn is_approving(&self, contract_address: &str) -> bool {
        self.read()
            .approving
            .contains(&normalize_address(contract_address))
    }

    fn begin_approval(&self, key: &str) -> EscrowResult<String> {
        let caller = self.wallet.require_address()?;
        let mut state = self.write();

        let record = state
            .records
            .iter()
            .find(|record| record.contract_address == key)
            .ok_or_else(|| EscrowError::Validation(format!("no escrow record for {}", key)))?;
        if record.needs_refresh {
            return Err(EscrowError::Validation(format!(
                "escrow {} changed on chain; refresh it before approving",
                key
            )));
        }
        if record.status != EscrowStatus::WaitingForJudge {
            return Err(EscrowError::Validation(format!(
                "escrow {} is {}; only escrows waiting for judge can be approved",
                key, record.status
            )));
        }
        if !state.approving.insert(key.to_string()) {
            return Err(EscrowError::Validation(format!(
                "approval of {} is already in progress",
                key
            )));
        }
        Ok(caller)
    }

    /// Send `approve()` and wait for it to be mined. Returns the tx hash.
    async fn send_approval(&self, caller: &str, key: &str) -> EscrowResult<Option<String>> {
        let request = ContractCallRequest::new(
            key,
            Arc::clone(&self.escrow_abi),
            APPROVE_FUNCTION,
            Vec::new(),
        )?;

        match self.gateway.call(Some(caller), &request).await {
            TransactionOutcome::Success(receipt) => Ok(receipt.transaction_hash),
            TransactionOutcome::Error(failure) => Err(EscrowError::from(failure)),
            TransactionOutcome::Pending => Err(EscrowError::call(
                CallErrorKind::Rpc,
                "call ended without an outcome",
            )),
        }
    }

    fn apply_approval(&self, key: &str, status: Option<EscrowStatus>) {
        let mut state = self.write();
        state.approving.remove(key);
        if let Some(record) = Arc::make_mut(&mut state.records)
            .iter_mut()
            .find(|record| record.contract_address == key)
        {
            match status {
                Some(status) => {
                    record.status = status;
                    record.needs_refresh = false;
                }
                None => record.needs_refresh = true,
            }
        }
    }

    async fn read_status(&self, address: &str) -> EscrowResult<EscrowStatus> {
        let value = self.read_field(address, "status").await?;
        let code = value_uint(&value)
            .ok_or_else(|| EscrowError::call(CallErrorKind::Encoding, "status() is not a uint"))?;
        EscrowStatus::from_code(code).ok_or_else(|| {
            EscrowError::call(
                CallErrorKind::Encoding,
                format!("unknown escrow status code {}", code),
            )
        })
    }

    async fn fetch_record(&self, address: &str, name: Option<&str>) -> EscrowResult<EscrowRecord> {
        let payer = self.read_address(address, "payer").await?;
        let beneficiary = self.read_address(address, "beneficiary").await?;
        let status = self.read_status(address).await?;
        let balance = value_uint(&self.read_field(address, "approvedBalance").await?)
            .ok_or_else(|| {
                EscrowError::call(CallErrorKind::Encoding, "approvedBalance() is not a uint")
            })?;
        let image_uri = self
            .read_field(address, "assetURI")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(EscrowRecord {
            contract_address: address.to_string(),
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| format!("Escrow {}", address.get(..10).unwrap_or(address))),
            payer_address: payer,
            beneficiary_address: beneficiary,
            approved_balance: format_token_amount(balance, self.token_decimals, &self.token_symbol),
            status,
            image_uri,
            needs_refresh: false,
        })
    }

    async fn read_address(&self, address: &str, function: &str) -> EscrowResult<String> {
        value_address(&self.read_field(address, function).await?).ok_or_else(|| {
                EscrowError::call(
                    CallErrorKind::Encoding,
                    format!("{}() is not an address", function),
                )
            })
    }

    async fn read_field(&self, address: &str, function: &str) -> EscrowResult<DynSolValue> {
        let request =
            ContractCallRequest::new(address, Arc::clone(&self.escrow_abi), function, Vec::new())?;
        self.gateway
            .read(&request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EscrowError::call(
                    CallErrorKind::Encoding,
                    format!("{}() returned no value", function),
                )
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, BoardState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BoardState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The demo companies shown before any escrow is loaded from chain.
pub fn placeholder_records() -> Vec<EscrowRecord> {
    const ZERO: &str = "0x0000000000000000000000000000000000000000";
    let companies = [
        (
            "Tesla",
            EscrowStatus::Completed,
            "https://images.unsplash.com/photo-1579547621706-1a9c79d5c9f1?auto=format&fit=crop&w=2370&q=80",
        ),
        (
            "Facebook",
            EscrowStatus::Completed,
            "https://images.unsplash.com/photo-1557683311-eac922347aa1?auto=format&fit=crop&w=2329&q=80",
        ),
        (
            "Apple, Inc.",
            EscrowStatus::WaitingForJudge,
            "https://images.unsplash.com/photo-1557682224-5b8590cd9ec5?auto=format&fit=crop&w=2329&q=80",
        ),
        (
            "Ford",
            EscrowStatus::WaitingForJudge,
            "https://images.unsplash.com/photo-1557682260-96773eb01377?auto=format&fit=crop&w=2329&q=80",
        ),
        (
            "Snap, Inc.",
            EscrowStatus::Processing,
            "https://images.unsplash.com/photo-1557683316-973673baf926?auto=format&fit=crop&w=2329&q=80",
        ),
        (
            "Ethereum Foundation",
            EscrowStatus::Processing,
            "https://images.unsplash.com/photo-1569982175971-d92b01cf8694?auto=format&fit=crop&w=1335&q=80",
        ),
    ];

    companies
        .iter()
        .enumerate()
        .map(|(index, (name, status, image_uri))| EscrowRecord {
            contract_address: format!("0x{:040x}", index + 1),
            name: name.to_string(),
            payer_address: ZERO.to_string(),
            beneficiary_address: ZERO.to_string(),
            approved_balance: "0 MATIC".to_string(),
            status: *status,
            image_uri: image_uri.to_string(),
            needs_refresh: false,
        })
        .collect()
}
