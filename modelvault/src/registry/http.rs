//! HTTP implementation of the model registry client.
//!
//! Talks to a Civitai-compatible REST API. Retries transient failures up
//! to three times with exponential backoff and honors `Retry-After` on
//! rate limiting; the resolver performs no retries of its own on top of
//! this.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ModelFile, ModelRegistry, ModelSummary, ModelVersion, RegistryError};

/// Default registry API base.
pub const DEFAULT_BASE_URL: &str = "https://civitai.com/api/v1";

/// Per-request timeout. Covers headers and body of JSON lookups only;
/// file downloads go through the downloader, not this client.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Retry attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Upper bound on a server-requested rate-limit wait.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Registry client over HTTP with bearer-token auth.
#[derive(Clone, Debug)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRegistry {
    /// Create a client for the default registry.
    ///
    /// The API key is carried explicitly; nothing is read from ambient
    /// environment state.
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    /// Create a client against a custom API base (used by tests).
    pub fn with_base_url(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// GET a JSON document, treating 404 as `None`.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, RegistryError> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.client.get(url).query(query);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let result = request.send().await;
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(RegistryError::Request(e.to_string()));
                    }
                    let wait = Duration::from_secs(1 << (attempt - 1));
                    warn!(url, error = %e, wait_secs = wait.as_secs(), "registry request failed, retrying");
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                // Rate limiting counts against the same retry budget as
                // network failures; a persistently throttling server must
                // not trap the caller.
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(RegistryError::Status {
                        status: 429,
                        url: url.to_string(),
                    });
                }
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(5)
                    .min(MAX_RETRY_AFTER_SECS);
                warn!(url, wait_secs = wait, attempt, "registry rate limited");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            if status.as_u16() == 404 {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(RegistryError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            debug!(url, status = status.as_u16(), "registry response");
            return response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| RegistryError::Parse {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
        }
    }

    /// Raw image metadata for an image id, or `None` if unknown.
    pub async fn image_metadata(
        &self,
        image_id: u64,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let url = format!("{}/images", self.base_url);
        let page: Option<ApiImagePage> = self
            .get_json(&url, &[("imageId", image_id.to_string()), ("nsfw", "X".to_string())])
            .await?;
        Ok(page.and_then(|p| p.items.into_iter().next()))
    }

    /// Server-side resolved generation data for an image, or `None`.
    ///
    /// This endpoint returns resources with `modelVersionId` even when
    /// the uploader hid model info from the embedded metadata.
    pub async fn generation_data(
        &self,
        image_id: u64,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let url = format!(
            "{}/trpc/image.getGenerationData",
            self.base_url.trim_end_matches("/v1")
        );
        let input = serde_json::json!({ "json": { "id": image_id } }).to_string();
        let envelope: Option<serde_json::Value> =
            self.get_json(&url, &[("input", input)]).await?;
        Ok(envelope.and_then(|v| {
            v.pointer("/result/data/json").cloned().filter(|j| !j.is_null())
        }))
    }

    fn convert_version(&self, api: ApiVersion) -> ModelVersion {
        let model = api.model.unwrap_or_default();
        let files = api
            .files
            .into_iter()
            .map(|f| {
                // The registry omits downloadUrl on some gated files; the
                // canonical per-version download route always works.
                let fallback = format!("{}/download/models/{}", self.base_url, api.id);
                ModelFile {
                    name: f.name,
                    size_kb: f.size_kb,
                    download_url: f.download_url.or(Some(fallback)),
                    primary: f.primary,
                    sha256: f.hashes.and_then(|h| h.sha256),
                }
            })
            .collect();

        ModelVersion {
            id: api.id,
            model_id: api.model_id.or(model.id),
            model_name: model.name,
            model_kind: model.kind,
            files,
        }
    }
}

impl ModelRegistry for HttpRegistry {
    fn version_by_hash<'a>(
        &'a self,
        hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ModelVersion>, RegistryError>> {
        Box::pin(async move {
            let url = format!("{}/model-versions/by-hash/{}", self.base_url, hash);
            let api: Option<ApiVersion> = self.get_json(&url, &[]).await?;
            Ok(api.map(|v| self.convert_version(v)))
        })
    }

    fn version_by_id(
        &self,
        version_id: u64,
    ) -> BoxFuture<'_, Result<Option<ModelVersion>, RegistryError>> {
        Box::pin(async move {
            let url = format!("{}/model-versions/{}", self.base_url, version_id);
            let api: Option<ApiVersion> = self.get_json(&url, &[]).await?;
            Ok(api.map(|v| self.convert_version(v)))
        })
    }

    fn search_models<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ModelSummary>, RegistryError>> {
        Box::pin(async move {
            let url = format!("{}/models", self.base_url);
            let page: Option<ApiModelPage> = self
                .get_json(
                    &url,
                    &[("query", query.to_string()), ("limit", limit.to_string())],
                )
                .await?;

            let items = page.map(|p| p.items).unwrap_or_default();
            Ok(items
                .into_iter()
                .map(|m| ModelSummary {
                    id: m.id,
                    name: m.name,
                    kind: m.kind,
                    versions: m
                        .versions
                        .into_iter()
                        .map(|v| self.convert_version(v))
                        .collect(),
                })
                .collect())
        })
    }
}

// ---------------------------------------------------------------------------
// Wire shapes (registry JSON is camelCase)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiImagePage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiModelPage {
    #[serde(default)]
    items: Vec<ApiModel>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: u64,
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "modelVersions", default)]
    versions: Vec<ApiVersion>,
}

#[derive(Debug, Deserialize)]
struct ApiVersion {
    id: u64,
    #[serde(rename = "modelId")]
    model_id: Option<u64>,
    #[serde(default)]
    model: Option<ApiModelRef>,
    #[serde(default)]
    files: Vec<ApiFile>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiModelRef {
    id: Option<u64>,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiFile {
    name: String,
    #[serde(rename = "sizeKB")]
    size_kb: Option<f64>,
    #[serde(rename = "downloadUrl")]
    download_url: Option<String>,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    hashes: Option<ApiHashes>,
}

#[derive(Debug, Deserialize)]
struct ApiHashes {
    #[serde(rename = "SHA256")]
    sha256: Option<String>,
}
