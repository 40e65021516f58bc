//! HTTP client for nft.storage

use async_trait::async_trait;
use escrow_core::config::StorageConfig;
use escrow_core::error::{EscrowError, EscrowResult};
use escrow_core::uploader::{AssetFile, ContentStore, StoredContent, UploadMetadata};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Form field the asset is attached under; mirrored as `null` in `meta`.
const ASSET_FIELD: &str = "image";

/// Client for the nft.storage `/store` endpoint.
pub struct NftStorageClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    ok: bool,
    value: Option<StoreValue>,
    error: Option<StoreErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StoreValue {
    #[serde(default)]
    ipnft: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct StoreErrorBody {
    name: Option<String>,
    message: Option<String>,
}

impl NftStorageClient {
    pub fn new(endpoint: &str, token: impl Into<String>, timeout: Duration) -> EscrowResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EscrowError::Config(format!("cannot build storage client: {}", e)))?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_config(config: &StorageConfig) -> EscrowResult<Self> {
        Self::new(
            &config.endpoint,
            config.token.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    async fn handle_response(&self, response: reqwest::Response) -> EscrowResult<StoredContent> {
        let status = response.status();

        if status.is_success() {
            let body: StoreResponse = response.json().await.map_err(|e| {
                EscrowError::upload_rejected(format!("unreadable storage response: {}", e))
            })?;
            return match (body.ok, body.value) {
                (true, Some(value)) => {
                    debug!(ipnft = %value.ipnft, url = %value.url, "stored on nft.storage");
                    Ok(StoredContent { url: value.url })
                }
                _ => Err(EscrowError::upload_rejected(describe(body.error))),
            };
        }

        let message = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StoreResponse>(&message)
            .ok()
            .and_then(|body| body.error)
            .map(|error| describe(Some(error)))
            .unwrap_or(message);
        let message = format!("{}: {}", status.as_u16(), message);

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(EscrowError::upload_transient(message))
        } else {
            Err(EscrowError::upload_rejected(message))
        }
    }
}

fn describe(error: Option<StoreErrorBody>) -> String {
    match error {
        Some(StoreErrorBody {
            name: Some(name),
            message: Some(message),
        }) => format!("{}: {}", name, message),
        Some(StoreErrorBody {
            message: Some(message),
            ..
        }) => message,
        _ => "storage service reported failure".to_string(),
    }
}

#[async_trait]
impl ContentStore for NftStorageClient {
    fn store_id(&self) -> &'static str {
        "nft.storage"
    }

    async fn store(
        &self,
        metadata: &UploadMetadata,
        file: &AssetFile,
    ) -> EscrowResult<StoredContent> {
        if self.token.is_empty() {
            return Err(EscrowError::upload_rejected("storage token is not configured"));
        }

        let meta = serde_json::json!({
            "name": metadata.name,
            "description": metadata.description,
            ASSET_FIELD: null,
        });
        let part = Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)
            .map_err(|e| {
                EscrowError::upload_rejected(format!(
                    "invalid content type '{}': {}",
                    file.content_type, e
                ))
            })?;
        let form = Form::new()
            .text("meta", meta.to_string())
            .part(ASSET_FIELD, part);

        let url = format!("{}/store", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| EscrowError::upload_transient(format!("storage request failed: {}", e)))?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn asset() -> AssetFile {
        AssetFile::new("contract.pdf", "application/pdf", b"%PDF-1.7 terms".to_vec())
    }

    async fn client(server: &MockServer) -> NftStorageClient {
        NftStorageClient::new(&server.uri(), "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn stores_asset_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/store"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "value": {"ipnft": "bafyxyz", "url": "ipfs://bafyxyz/metadata.json"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let stored = client(&server)
            .await
            .store(&UploadMetadata::default(), &asset())
            .await
            .unwrap();
        assert_eq!(stored.url, "ipfs://bafyxyz/metadata.json");
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .store(&UploadMetadata::default(), &asset())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.message(), "503: maintenance");
    }

    #[tokio::test]
    async fn rate_limiting_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .store(&UploadMetadata::default(), &asset())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn auth_failures_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "ok": false,
                "error": {"name": "HTTPError", "message": "invalid token"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .store(&UploadMetadata::default(), &asset())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.name(), "UploadError");
        assert_eq!(err.message(), "401: HTTPError: invalid token");
    }

    #[tokio::test]
    async fn missing_token_never_hits_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = NftStorageClient::new(&server.uri(), "", Duration::from_secs(5)).unwrap();
        let err = client
            .store(&UploadMetadata::default(), &asset())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn trims_trailing_slash() {
        let client =
            NftStorageClient::new("https://api.nft.storage/", "t", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "https://api.nft.storage");
    }
}
