use crate::error::{EscrowError, EscrowResult};
use crate::types::{is_address, normalize_address, WalletSnapshot};
use async_trait::async_trait;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Boundary to an injected or external wallet.
///
/// Implementations perform account access on a chain; an absent or
/// unreachable wallet, or a user rejection, surfaces as
/// [`EscrowError::Connection`].
#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Request account access on `chain_id` and return the selected account.
    async fn request_accounts(&self, chain_id: u64) -> EscrowResult<String>;

    async fn disconnect(&self) -> EscrowResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    Connecting { chain_id: u64 },
    Connected { address: String, chain_id: u64 },
    ConnectFailed { message: String },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting { chain_id: u64 },
    Connected { address: String, chain_id: u64 },
}

/// The one wallet session of a client process.
///
/// Shared as `Arc<WalletSession>` and injected into each view-model.
pub struct WalletSession {
    provider: Arc<dyn WalletProvider>,
    state: RwLock<SessionState>,
    events: broadcast::Sender<WalletEvent>,
}

impl WalletSession {
    pub fn new(provider: Arc<dyn WalletProvider>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            provider,
            state: RwLock::new(SessionState::Disconnected),
            events,
        }
    }

    pub fn provider_id(&self) -> &'static str {
        self.provider.provider_id()
    }

    /// Disconnected -> Connected(address). Idempotent for the same chain.
    pub async fn connect(&self, chain_id: u64) -> EscrowResult<String> {
        if chain_id == 0 {
            return Err(EscrowError::Connection("chain id must be non-zero".to_string()));
        }

        if let SessionState::Connected {
            address,
            chain_id: connected_chain,
        } = &*self.read()
        {
            if *connected_chain == chain_id {
                return Ok(address.clone());
            }
        }

        *self.write() = SessionState::Connecting { chain_id };
        self.emit(WalletEvent::Connecting { chain_id });

        let result = self
            .provider
            .request_accounts(chain_id)
            .await
            .and_then(|address| {
                if is_address(&address) {
                    Ok(normalize_address(&address))
                } else {
                    Err(EscrowError::Connection(format!(
                        "wallet returned malformed account '{}'",
                        address
                    )))
                }
            });

        match result {
            Ok(address) => {
                *self.write() = SessionState::Connected {
                    address: address.clone(),
                    chain_id,
                };
                info!(
                    provider = self.provider.provider_id(),
                    chain_id,
                    address = %address,
                    "wallet connected"
                );
                self.emit(WalletEvent::Connected {
                    address: address.clone(),
                    chain_id,
                });
                Ok(address)
            }
            Err(err) => {
                *self.write() = SessionState::Disconnected;
                let err = match err {
                    EscrowError::Connection(_) => err,
                    other => EscrowError::Connection(other.to_string()),
                };
                warn!(
                    provider = self.provider.provider_id(),
                    chain_id,
                    error = %err,
                    "wallet connection failed"
                );
                self.emit(WalletEvent::ConnectFailed {
                    message: err.message(),
                });
                Err(err)
            }
        }
    }

    /// Clears the local session even if the provider reports an error.
    pub async fn disconnect(&self) -> EscrowResult<()> {
        let provider_result = self.provider.disconnect().await;
        *self.write() = SessionState::Disconnected;
        info!(provider = self.provider.provider_id(), "wallet disconnected");
        self.emit(WalletEvent::Disconnected);

        provider_result.map_err(|err| {
            warn!(error = %err, "wallet provider disconnect reported an error");
            err
        })
    }

    pub fn current_address(&self) -> Option<String> {
        match &*self.read() {
            SessionState::Connected { address, .. } => Some(address.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.read(), SessionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(&*self.read(), SessionState::Connecting { .. })
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        match &*self.read() {
            SessionState::Connected { address, chain_id } => WalletSnapshot {
                address: Some(address.clone()),
                is_connected: true,
                chain_id: Some(*chain_id),
            },
            SessionState::Connecting { chain_id } => WalletSnapshot {
                address: None,
                is_connected: false,
                chain_id: Some(*chain_id),
            },
            SessionState::Disconnected => WalletSnapshot::default(),
        }
    }

    /// Connected account, or a validation error for gated actions.
    pub fn require_address(&self) -> EscrowResult<String> {
        self.current_address()
            .ok_or_else(|| EscrowError::Validation("wallet is not connected".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: WalletEvent) {
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
