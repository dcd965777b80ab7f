//! Resource types shared by the resolver, store, and download manager.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Category of a downloadable model artifact.
///
/// Closed enum so that an unexpected registry type cannot leak a
/// free-form string into directory layout decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Checkpoint,
    Lora,
    Vae,
    Embedding,
    Upscaler,
    Other,
}

impl ModelKind {
    /// Normalize a registry type string.
    ///
    /// Registries are inconsistent about casing and synonyms
    /// ("Checkpoint"/"model", "LORA"/"LoCon"/"lycoris",
    /// "TextualInversion"). Anything unrecognized maps to `Other`.
    pub fn from_registry(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "checkpoint" | "model" => Self::Checkpoint,
            "lora" | "locon" | "lycoris" | "dora" => Self::Lora,
            "vae" => Self::Vae,
            "textualinversion" | "embedding" | "embed" => Self::Embedding,
            "upscaler" => Self::Upscaler,
            _ => Self::Other,
        }
    }

    /// Subdirectory name under the models root for this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoints",
            Self::Lora => "loras",
            Self::Vae => "vae",
            Self::Embedding => "embeddings",
            Self::Upscaler => "upscale_models",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Checkpoint => "checkpoint",
            Self::Lora => "lora",
            Self::Vae => "vae",
            Self::Embedding => "embedding",
            Self::Upscaler => "upscaler",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// How a reference was matched to a registry artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMethod {
    ByHash,
    ByVersionId,
    ByName,
    Unresolved,
}

/// A resolved reference to one downloadable model artifact.
///
/// Produced by the [`Resolver`](super::Resolver) and consumed by the
/// download task manager, which stores a snapshot rather than a live
/// reference.
///
/// Invariants:
/// - `resolved == true` implies `download_url`, `filename`, and
///   `target_path` are all present.
/// - `already_downloaded == true` implies a file exists at
///   `target_path`; no network call is required or permitted for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    /// Display name, from the reference or backfilled from the registry.
    pub name: String,

    /// Model category, normalized.
    pub kind: ModelKind,

    /// Content hash declared by the reference, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Application weight/strength declared by the reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    /// Registry model id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,

    /// Registry model version id. Dedup key across references.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<u64>,

    /// Direct download URL for the primary file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    /// Canonical filename from the registry (never user input).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Expected file size in kilobytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<f64>,

    /// Expected SHA-256 of the primary file, when the registry knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Directory the file belongs in, derived from `kind`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<PathBuf>,

    /// Full destination path (`target_dir` + `filename`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<PathBuf>,

    /// A matching file already exists locally.
    pub already_downloaded: bool,

    /// The reference was matched to a concrete artifact.
    pub resolved: bool,

    /// Strategy that produced the match.
    pub resolve_method: ResolveMethod,

    /// Per-reference resolution error, when unresolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Resource {
    /// An unresolved placeholder carrying what the reference declared.
    pub fn unresolved(name: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            hash: None,
            weight: None,
            model_id: None,
            model_version_id: None,
            download_url: None,
            filename: None,
            size_kb: None,
            sha256: None,
            target_dir: None,
            target_path: None,
            already_downloaded: false,
            resolved: false,
            resolve_method: ResolveMethod::Unresolved,
            error: None,
        }
    }

    /// Expected size in bytes, when known.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size_kb.map(|kb| (kb * 1024.0) as u64)
    }

    /// True when this resource still needs a download.
    pub fn needs_download(&self) -> bool {
        self.resolved && !self.already_downloaded
    }
}

/// Result of resolving a batch of metadata references.
///
/// The counts are tallied per input reference, before deduplication;
/// `resources` holds the deduplicated list (first occurrence of each
/// model version wins).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub resources: Vec<Resource>,
    pub resolved_count: usize,
    pub unresolved_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_registry_synonyms() {
        assert_eq!(ModelKind::from_registry("Checkpoint"), ModelKind::Checkpoint);
        assert_eq!(ModelKind::from_registry("model"), ModelKind::Checkpoint);
        assert_eq!(ModelKind::from_registry("LORA"), ModelKind::Lora);
        assert_eq!(ModelKind::from_registry("LoCon"), ModelKind::Lora);
        assert_eq!(ModelKind::from_registry("TextualInversion"), ModelKind::Embedding);
        assert_eq!(ModelKind::from_registry("VAE"), ModelKind::Vae);
        assert_eq!(ModelKind::from_registry("Upscaler"), ModelKind::Upscaler);
        assert_eq!(ModelKind::from_registry("MotionModule"), ModelKind::Other);
    }

    #[test]
    fn test_kind_dir_names() {
        assert_eq!(ModelKind::Checkpoint.dir_name(), "checkpoints");
        assert_eq!(ModelKind::Lora.dir_name(), "loras");
        assert_eq!(ModelKind::Embedding.dir_name(), "embeddings");
        assert_eq!(ModelKind::Upscaler.dir_name(), "upscale_models");
    }

    #[test]
    fn test_unresolved_placeholder() {
        let r = Resource::unresolved("detail tweaker", ModelKind::Lora);
        assert!(!r.resolved);
        assert!(!r.needs_download());
        assert_eq!(r.resolve_method, ResolveMethod::Unresolved);
    }

    #[test]
    fn test_size_bytes() {
        let mut r = Resource::unresolved("m", ModelKind::Checkpoint);
        assert_eq!(r.size_bytes(), None);
        r.size_kb = Some(1024.0);
        assert_eq!(r.size_bytes(), Some(1024 * 1024));
    }

    #[test]
    fn test_serde_snake_case_wire_names() {
        let r = Resource::unresolved("m", ModelKind::Checkpoint);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["already_downloaded"], false);
        assert_eq!(json["resolve_method"], "unresolved");
        assert_eq!(json["kind"], "checkpoint");
    }
}
