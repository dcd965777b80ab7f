//! Model registry client.
//!
//! The registry is an external collaborator: given a content hash, a
//! version id, or a name query it returns enough information to download
//! a concrete model file. The resolver only depends on the
//! [`ModelRegistry`] trait; [`HttpRegistry`] is the production
//! implementation against a Civitai-compatible REST API.

mod http;

pub use http::{HttpRegistry, DEFAULT_BASE_URL};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from registry lookups.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transport-level failure (connect, TLS, timeout).
    #[error("registry request failed: {0}")]
    Request(String),

    /// Registry answered with an unexpected HTTP status.
    #[error("registry returned status {status} for {url}")]
    Status { status: u16, url: String },

    /// Response body did not parse as the expected shape.
    #[error("failed to parse registry response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

/// One downloadable file within a model version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelFile {
    /// Canonical filename as published by the registry.
    pub name: String,

    /// Size in kilobytes.
    pub size_kb: Option<f64>,

    /// Direct download URL.
    pub download_url: Option<String>,

    /// Whether the registry flags this as the primary file.
    #[serde(default)]
    pub primary: bool,

    /// SHA-256 digest, lowercase or uppercase hex.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A concrete model version with its files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: u64,

    pub model_id: Option<u64>,

    /// Parent model name, when the registry includes it.
    pub model_name: Option<String>,

    /// Parent model type string, unnormalized.
    pub model_kind: Option<String>,

    #[serde(default)]
    pub files: Vec<ModelFile>,
}

impl ModelVersion {
    /// The file a download should fetch: the first file flagged
    /// `primary`, falling back to the first file.
    pub fn primary_file(&self) -> Option<&ModelFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }
}

/// A model as returned by a name search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: u64,
    pub name: String,

    /// Registry type string, unnormalized.
    pub kind: Option<String>,

    #[serde(default)]
    pub versions: Vec<ModelVersion>,
}

/// Narrow lookup interface the resolver depends on.
///
/// Methods return boxed futures so implementations can live behind
/// `Arc<dyn ModelRegistry>` without a proc-macro dependency.
pub trait ModelRegistry: Send + Sync + 'static {
    /// Look up a model version by file content hash.
    ///
    /// `Ok(None)` means the hash is unknown to the registry.
    fn version_by_hash<'a>(
        &'a self,
        hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ModelVersion>, RegistryError>>;

    /// Look up a model version by its id.
    fn version_by_id(
        &self,
        version_id: u64,
    ) -> BoxFuture<'_, Result<Option<ModelVersion>, RegistryError>>;

    /// Search models by name.
    fn search_models<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ModelSummary>, RegistryError>>;
}
