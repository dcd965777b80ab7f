//! Image metadata parsing and resource extraction.
//!
//! Turns a raw registry image payload into a [`Metadata`] record with a
//! normalized list of [`MetadataResource`] references. Resources come
//! from three sources, tried in order of data quality:
//!
//! 1. Server-side generation data (has `modelVersionId` even when the
//!    uploader hid model info)
//! 2. `meta.civitaiResources` (version id + weight, no name)
//! 3. `meta.resources` (name + hash + weight, no version id)

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::{HttpRegistry, RegistryError};
use crate::resolver::ModelKind;

/// Errors from image-id parsing.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Input is neither a numeric id nor a recognizable image URL.
    #[error("cannot parse image id from {0:?}")]
    InvalidImageId(String),
}

/// A model reference as declared in image generation metadata.
///
/// Immutable input to the resolver; one image yields zero or more.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataResource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ModelKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<u64>,
}

/// Normalized generation metadata for one image.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub image_id: Option<u64>,
    pub image_url: Option<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler: String,
    pub steps: Option<u64>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub model_name: String,
    pub model_hash: String,
    pub resources: Vec<MetadataResource>,
}

/// Extract an image id from a bare number or an image page URL.
pub fn parse_image_id(input: &str) -> Result<u64, MetadataError> {
    let trimmed = input.trim();
    if let Ok(id) = trimmed.parse::<u64>() {
        return Ok(id);
    }
    static IMAGE_URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = IMAGE_URL_RE.get_or_init(|| Regex::new(r"/images/(\d+)").expect("valid regex"));
    if let Some(caps) = re.captures(trimmed) {
        if let Ok(id) = caps[1].parse::<u64>() {
            return Ok(id);
        }
    }
    Err(MetadataError::InvalidImageId(input.to_string()))
}

/// Normalize a raw image payload into a [`Metadata`] record.
///
/// Resources are not populated here; they come from
/// [`extract_resources`] which needs the generation-data payload too.
pub fn extract_metadata(image: &Value) -> Metadata {
    let mut meta = image.get("meta").cloned().unwrap_or(Value::Null);
    // Some payloads nest the interesting fields one level down.
    if let Some(inner) = meta.get("meta").filter(|m| m.is_object()) {
        meta = inner.clone();
    }

    let (mut width, mut height) = (512u32, 512u32);
    if let Some(size) = meta.get("Size").and_then(Value::as_str) {
        if let Some((w, h)) = size.split_once('x') {
            if let (Ok(w), Ok(h)) = (w.trim().parse(), h.trim().parse()) {
                width = w;
                height = h;
            }
        }
    } else if let (Some(w), Some(h)) = (
        image.get("width").and_then(Value::as_u64),
        image.get("height").and_then(Value::as_u64),
    ) {
        width = w as u32;
        height = h as u32;
    }

    let str_field = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Metadata {
        image_id: image.get("id").and_then(Value::as_u64),
        image_url: image
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string),
        prompt: str_field(&meta, "prompt"),
        negative_prompt: str_field(&meta, "negativePrompt"),
        sampler: str_field(&meta, "sampler"),
        steps: meta.get("steps").and_then(Value::as_u64),
        cfg_scale: meta.get("cfgScale").and_then(Value::as_f64),
        seed: meta.get("seed").and_then(Value::as_i64),
        width,
        height,
        model_name: str_field(&meta, "Model"),
        model_hash: str_field(&meta, "Model hash"),
        resources: Vec::new(),
    }
}

/// Build the resource list with the quality-ordered fallback chain.
///
/// `generation_data` is the server-side payload (may be `None`);
/// `image` is the raw image payload whose `meta` carries the REST
/// fallbacks.
pub fn extract_resources(generation_data: Option<&Value>, image: &Value) -> Vec<MetadataResource> {
    if let Some(data) = generation_data {
        let from_server = resources_from_generation_data(data);
        if !from_server.is_empty() {
            return from_server;
        }
    }

    let meta = image.get("meta").cloned().unwrap_or(Value::Null);
    let from_civitai = resources_from_civitai_resources(&meta);
    if !from_civitai.is_empty() {
        return from_civitai;
    }
    resources_from_meta_resources(&meta)
}

/// Fetch and fully populate metadata for an image id.
///
/// Returns `Ok(None)` when the image does not exist. A failing
/// generation-data call degrades to the REST fallbacks rather than
/// failing the fetch.
pub async fn fetch_metadata(
    registry: &HttpRegistry,
    image_id: u64,
) -> Result<Option<Metadata>, RegistryError> {
    let Some(image) = registry.image_metadata(image_id).await? else {
        return Ok(None);
    };

    let generation_data = match registry.generation_data(image_id).await {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(image_id, error = %e, "generation data fetch failed, using embedded metadata");
            None
        }
    };

    let mut metadata = extract_metadata(&image);
    metadata.image_id = metadata.image_id.or(Some(image_id));
    metadata.resources = extract_resources(generation_data.as_ref(), &image);

    // Backfill the headline model name from the checkpoint resource.
    if metadata.model_name.is_empty()
        || metadata.model_name.eq_ignore_ascii_case("unknown")
        || metadata.model_name.eq_ignore_ascii_case("unknown_model")
    {
        if let Some(name) = metadata
            .resources
            .iter()
            .find(|r| r.kind == Some(ModelKind::Checkpoint))
            .and_then(|r| r.name.clone())
        {
            metadata.model_name = name;
        }
    }

    Ok(Some(metadata))
}

fn kind_of(raw: Option<&str>) -> Option<ModelKind> {
    raw.map(ModelKind::from_registry)
}

/// LoRAs with a null strength apply at full strength.
fn default_lora_weight(weight: Option<f64>, kind: Option<ModelKind>) -> Option<f64> {
    match (weight, kind) {
        (None, Some(ModelKind::Lora)) => Some(1.0),
        (w, _) => w,
    }
}

fn resources_from_generation_data(data: &Value) -> Vec<MetadataResource> {
    let Some(items) = data.get("resources").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|r| {
            let version_id = r.get("modelVersionId").and_then(Value::as_u64)?;
            let kind = kind_of(r.get("modelType").and_then(Value::as_str));
            let weight = default_lora_weight(r.get("strength").and_then(Value::as_f64), kind);
            Some(MetadataResource {
                name: r
                    .get("modelName")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                kind,
                weight,
                hash: None,
                model_version_id: Some(version_id),
            })
        })
        .collect()
}

fn resources_from_civitai_resources(meta: &Value) -> Vec<MetadataResource> {
    let Some(items) = meta.get("civitaiResources").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut resources: Vec<MetadataResource> = Vec::new();
    for r in items {
        let version_id = r.get("modelVersionId").and_then(Value::as_u64);
        // Same version listed twice collapses to one entry.
        if let Some(id) = version_id {
            if resources.iter().any(|e| e.model_version_id == Some(id)) {
                continue;
            }
        }
        let kind = kind_of(r.get("type").and_then(Value::as_str));
        let weight = default_lora_weight(r.get("weight").and_then(Value::as_f64), kind);
        resources.push(MetadataResource {
            name: r
                .get("modelName")
                .and_then(Value::as_str)
                .map(str::to_string),
            kind,
            weight,
            hash: None,
            model_version_id: version_id,
        });
    }
    resources
}

fn resources_from_meta_resources(meta: &Value) -> Vec<MetadataResource> {
    let Some(items) = meta.get("resources").and_then(Value::as_array) else {
        return Vec::new();
    };

    // "hashes" maps "LORA:<name>" keys to content hashes for LoRAs that
    // lack a hash on the resource entry itself.
    let lora_hashes = meta.get("hashes").and_then(Value::as_object);

    items
        .iter()
        .map(|r| {
            let name = r.get("name").and_then(Value::as_str).map(str::to_string);
            let kind = kind_of(r.get("type").and_then(Value::as_str));
            let mut hash = r.get("hash").and_then(Value::as_str).map(str::to_string);
            if hash.is_none() && kind == Some(ModelKind::Lora) {
                if let (Some(hashes), Some(name)) = (lora_hashes, name.as_deref()) {
                    hash = hashes
                        .get(&format!("LORA:{}", name))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
            let weight = default_lora_weight(r.get("weight").and_then(Value::as_f64), kind);
            MetadataResource {
                name,
                kind,
                weight,
                hash,
                model_version_id: None,
            }
        })
        .collect()
}
