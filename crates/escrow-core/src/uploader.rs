use crate::error::{EscrowError, EscrowResult};
use crate::types::UploadResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A local file selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AssetFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> EscrowResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EscrowError::Validation(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string());
        let content_type = content_type_for(&file_name).to_string();

        Ok(Self {
            file_name,
            content_type,
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "txt" | "md" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Metadata envelope stored alongside every asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub name: String,
    pub description: String,
}

impl Default for UploadMetadata {
    fn default() -> Self {
        Self {
            name: "Escrow contract".to_string(),
            description: "Contract document attached to an escrow agreement".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContent {
    pub url: String,
}

/// Content-addressed storage service.
///
/// Transient failures (network, 5xx, rate limiting) must be reported with
/// [`EscrowError::upload_transient`] so the uploader can retry them.
#[async_trait]
pub trait ContentStore: Send + Sync {
    fn store_id(&self) -> &'static str;

    async fn store(&self, metadata: &UploadMetadata, file: &AssetFile)
        -> EscrowResult<StoredContent>;
}

/// Retry policy for transient upload failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.backoff_ms);
        let delay = if self.exponential_backoff {
            let factor = 2u32.saturating_pow(retry.saturating_sub(1));
            base.saturating_mul(factor)
        } else {
            base
        };
        delay.min(MAX_BACKOFF)
    }
}

/// Uploads contract assets. Uploads are idempotent by content address, so
/// transient failures are retried.
pub struct AssetUploader {
    store: Arc<dyn ContentStore>,
    metadata: UploadMetadata,
    retry: RetryPolicy,
}

impl AssetUploader {
    pub fn new(store: Arc<dyn ContentStore>, metadata: UploadMetadata, retry: RetryPolicy) -> Self {
        Self {
            store,
            metadata,
            retry,
        }
    }

    pub fn metadata(&self) -> &UploadMetadata {
        &self.metadata
    }

    pub async fn upload(&self, file: &AssetFile) -> EscrowResult<UploadResult> {
        if file.is_empty() {
            return Err(EscrowError::Validation(format!(
                "asset '{}' is empty",
                file.file_name
            )));
        }

        let mut retries = 0u32;
        loop {
            match self.store.store(&self.metadata, file).await {
                Ok(stored) => {
                    info!(
                        store = self.store.store_id(),
                        file = %file.file_name,
                        bytes = file.len(),
                        uri = %stored.url,
                        "asset uploaded"
                    );
                    return Ok(UploadResult {
                        content_uri: stored.url,
                    });
                }
                Err(err) if err.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    let delay = self.retry.delay_for(retries);
                    warn!(
                        store = self.store.store_id(),
                        retry = retries,
                        ?delay,
                        error = %err,
                        "transient upload failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        store = self.store.store_id(),
                        file = %file.file_name,
                        error = %err,
                        "asset upload failed"
                    );
                    return Err(match err {
                        EscrowError::Upload { .. } => err,
                        other => EscrowError::upload_rejected(other.to_string()),
                    });
                }
            }
        }
    }
}
