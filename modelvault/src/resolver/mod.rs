//! Resource resolver.
//!
//! Matches metadata-declared references to concrete downloadable
//! artifacts. Strategies run in priority order per reference:
//!
//! 1. Content hash — authoritative on a hit; a conflicting declared
//!    name is ignored.
//! 2. Model version id.
//! 3. Fuzzy name search — only a single unambiguous match is accepted.
//!
//! Registry errors on one reference never abort the batch; they are
//! recorded on that resource and resolution continues. The only
//! filesystem side effects are stat calls through the [`ModelStore`].

mod types;

pub use types::{ModelKind, ResolveMethod, Resource, ResolveOutcome};

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::metadata::MetadataResource;
use crate::registry::{ModelRegistry, ModelVersion};
use crate::store::ModelStore;

/// Error string for a name lookup that found nothing or too much.
const AMBIGUOUS_OR_NOT_FOUND: &str = "ambiguous or not found";

/// Search page size for name lookups.
const NAME_SEARCH_LIMIT: usize = 5;

/// Resolves metadata references against a model registry and the local
/// model store.
pub struct Resolver<R: ModelRegistry + ?Sized> {
    registry: Arc<R>,
    store: ModelStore,
}

impl<R: ModelRegistry + ?Sized> Resolver<R> {
    pub fn new(registry: Arc<R>, store: ModelStore) -> Self {
        Self { registry, store }
    }

    /// Resolve a batch of references.
    ///
    /// Counts are tallied per input reference before deduplication, so
    /// `resolved_count + unresolved_count == refs.len()` always holds.
    /// Two references resolving to the same model version collapse into
    /// one resource; the first occurrence wins and weights are not
    /// summed.
    pub async fn resolve(&self, refs: &[MetadataResource]) -> ResolveOutcome {
        let mut resources = Vec::with_capacity(refs.len());
        let mut seen_versions: HashSet<u64> = HashSet::new();
        let mut resolved_count = 0;
        let mut unresolved_count = 0;

        for reference in refs {
            let resource = self.resolve_one(reference).await;
            if resource.resolved {
                resolved_count += 1;
            } else {
                unresolved_count += 1;
            }

            if let Some(version_id) = resource.model_version_id {
                if !seen_versions.insert(version_id) {
                    debug!(version_id, name = %resource.name, "duplicate model version collapsed");
                    continue;
                }
            }
            resources.push(resource);
        }

        ResolveOutcome {
            resources,
            resolved_count,
            unresolved_count,
        }
    }

    async fn resolve_one(&self, reference: &MetadataResource) -> Resource {
        let declared_kind = reference.kind.unwrap_or(ModelKind::Checkpoint);
        let declared_name = reference
            .name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        let mut resource = Resource::unresolved(declared_name, declared_kind);
        resource.hash = reference.hash.clone();
        resource.weight = reference.weight;
        resource.target_dir = Some(self.store.dir_for(declared_kind));

        let mut registry_error: Option<String> = None;
        let mut name_search_ran = false;

        if let Some(hash) = reference.hash.as_deref() {
            match self.registry.version_by_hash(hash).await {
                Ok(Some(version)) => {
                    debug!(hash, "resolved by hash");
                    return self.fill(resource, version, ResolveMethod::ByHash, None);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(hash, error = %e, "hash lookup failed");
                    registry_error = Some(e.to_string());
                }
            }
        }

        if let Some(version_id) = reference.model_version_id {
            match self.registry.version_by_id(version_id).await {
                Ok(Some(version)) => {
                    debug!(version_id, "resolved by version id");
                    return self.fill(resource, version, ResolveMethod::ByVersionId, None);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(version_id, error = %e, "version id lookup failed");
                    registry_error = Some(e.to_string());
                }
            }
        }

        if let Some(query) = reference.name.as_deref().filter(|n| !n.is_empty()) {
            name_search_ran = true;
            match self.registry.search_models(query, NAME_SEARCH_LIMIT).await {
                Ok(models) => {
                    let query_lower = query.to_ascii_lowercase();
                    let mut matches = models.into_iter().filter(|m| {
                        let name_lower = m.name.to_ascii_lowercase();
                        !m.versions.is_empty()
                            && (name_lower.contains(&query_lower)
                                || query_lower.contains(&name_lower))
                    });

                    let first = matches.next();
                    match (first, matches.next()) {
                        (Some(model), None) => {
                            debug!(query, matched = %model.name, "resolved by name search");
                            let override_info = Some((model.id, model.kind.clone()));
                            if let Some(version) = model.versions.into_iter().next() {
                                return self.fill(
                                    resource,
                                    version,
                                    ResolveMethod::ByName,
                                    override_info,
                                );
                            }
                        }
                        (Some(_), Some(_)) => {
                            debug!(query, "name search ambiguous");
                        }
                        (None, _) => {
                            debug!(query, "name search found nothing");
                        }
                    }
                }
                Err(e) => {
                    warn!(query, error = %e, "name search failed");
                    registry_error = Some(e.to_string());
                }
            }
        }

        resource.error = Some(registry_error.unwrap_or_else(|| {
            if name_search_ran {
                AMBIGUOUS_OR_NOT_FOUND.to_string()
            } else {
                "could not resolve reference".to_string()
            }
        }));
        resource
    }

    /// Populate a resource from a registry version and consult the
    /// store for the target path and local existence.
    fn fill(
        &self,
        mut resource: Resource,
        version: ModelVersion,
        method: ResolveMethod,
        model_override: Option<(u64, Option<String>)>,
    ) -> Resource {
        resource.resolve_method = method;
        resource.model_version_id = Some(version.id);

        let (override_id, override_kind) = match model_override {
            Some((id, kind)) => (Some(id), kind),
            None => (None, None),
        };
        resource.model_id = override_id.or(version.model_id);

        // The registry's own type wins over whatever the metadata declared.
        if let Some(raw) = override_kind.as_deref().or(version.model_kind.as_deref()) {
            resource.kind = ModelKind::from_registry(raw);
        }

        if let Some(file) = version.primary_file() {
            resource.filename = Some(file.name.clone());
            resource.size_kb = file.size_kb;
            resource.download_url = file.download_url.clone();
            resource.sha256 = file.sha256.clone();
        }

        // Backfill a display name the UI can show.
        if resource.name.is_empty() || resource.name.eq_ignore_ascii_case("unknown") {
            if let Some(name) = version.model_name.clone() {
                resource.name = name;
            } else if let Some(filename) = resource.filename.as_deref() {
                resource.name = filename
                    .rsplit_once('.')
                    .map(|(stem, _)| stem.to_string())
                    .unwrap_or_else(|| filename.to_string());
            }
        }

        resource.target_dir = Some(self.store.dir_for(resource.kind));
        if let Some(filename) = resource.filename.clone() {
            match self.store.target_path(resource.kind, &filename) {
                Ok(path) => resource.target_path = Some(path),
                Err(e) => {
                    resource.error = Some(e.to_string());
                    return resource;
                }
            }
            // Existence only; content is checked at download time.
            if let Ok(Some(existing)) = self.store.find_existing(resource.kind, &filename) {
                resource.already_downloaded = true;
                resource.target_path = Some(existing);
            }
        }

        if resource.download_url.is_some()
            && resource.filename.is_some()
            && resource.target_path.is_some()
        {
            resource.resolved = true;
        } else {
            resource.error = Some("registry version has no downloadable file".to_string());
        }
        resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelFile, ModelSummary, RegistryError};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Scriptable registry stub.
    #[derive(Default)]
    struct StubRegistry {
        by_hash: Mutex<HashMap<String, ModelVersion>>,
        by_id: Mutex<HashMap<u64, ModelVersion>>,
        search: Mutex<HashMap<String, Vec<ModelSummary>>>,
        fail_hash: Mutex<bool>,
    }

    impl StubRegistry {
        fn version(id: u64, filename: &str, kind: &str) -> ModelVersion {
            ModelVersion {
                id,
                model_id: Some(id * 10),
                model_name: Some(format!("model-{id}")),
                model_kind: Some(kind.to_string()),
                files: vec![ModelFile {
                    name: filename.to_string(),
                    size_kb: Some(2048.0),
                    download_url: Some(format!("http://registry.test/download/{id}")),
                    primary: true,
                    sha256: None,
                }],
            }
        }
    }

    impl ModelRegistry for StubRegistry {
        fn version_by_hash<'a>(
            &'a self,
            hash: &'a str,
        ) -> BoxFuture<'a, Result<Option<ModelVersion>, RegistryError>> {
            Box::pin(async move {
                if *self.fail_hash.lock() {
                    return Err(RegistryError::Request("connection refused".to_string()));
                }
                Ok(self.by_hash.lock().get(hash).cloned())
            })
        }

        fn version_by_id(
            &self,
            version_id: u64,
        ) -> BoxFuture<'_, Result<Option<ModelVersion>, RegistryError>> {
            Box::pin(async move { Ok(self.by_id.lock().get(&version_id).cloned()) })
        }

        fn search_models<'a>(
            &'a self,
            query: &'a str,
            _limit: usize,
        ) -> BoxFuture<'a, Result<Vec<ModelSummary>, RegistryError>> {
            Box::pin(async move { Ok(self.search.lock().get(query).cloned().unwrap_or_default()) })
        }
    }

    fn resolver_with(temp: &TempDir, stub: StubRegistry) -> Resolver<StubRegistry> {
        Resolver::new(Arc::new(stub), ModelStore::new(temp.path()))
    }

    fn hash_ref(hash: &str) -> MetadataResource {
        MetadataResource {
            hash: Some(hash.to_string()),
            name: Some("declared-name".to_string()),
            kind: Some(ModelKind::Lora),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_by_hash_is_authoritative() {
        let temp = TempDir::new().unwrap();
        let stub = StubRegistry::default();
        stub.by_hash
            .lock()
            .insert("abc123".to_string(), StubRegistry::version(5, "m.safetensors", "Checkpoint"));
        let resolver = resolver_with(&temp, stub);

        let outcome = resolver.resolve(&[hash_ref("abc123")]).await;
        assert_eq!(outcome.resolved_count, 1);
        let r = &outcome.resources[0];
        assert!(r.resolved);
        assert_eq!(r.resolve_method, ResolveMethod::ByHash);
        // Registry type overrides the declared lora kind.
        assert_eq!(r.kind, ModelKind::Checkpoint);
        assert!(r.target_path.as_ref().unwrap().ends_with("checkpoints/m.safetensors"));
    }

    #[tokio::test]
    async fn test_resolve_by_version_id() {
        let temp = TempDir::new().unwrap();
        let stub = StubRegistry::default();
        stub.by_id
            .lock()
            .insert(77, StubRegistry::version(77, "tweaker.safetensors", "LORA"));
        let resolver = resolver_with(&temp, stub);

        let refs = [MetadataResource {
            model_version_id: Some(77),
            kind: Some(ModelKind::Lora),
            ..Default::default()
        }];
        let outcome = resolver.resolve(&refs).await;
        let r = &outcome.resources[0];
        assert_eq!(r.resolve_method, ResolveMethod::ByVersionId);
        assert_eq!(r.model_version_id, Some(77));
        // Name backfilled from the registry.
        assert_eq!(r.name, "model-77");
    }

    #[tokio::test]
    async fn test_resolve_by_name_single_match() {
        let temp = TempDir::new().unwrap();
        let stub = StubRegistry::default();
        stub.search.lock().insert(
            "dreamshaper".to_string(),
            vec![ModelSummary {
                id: 9,
                name: "DreamShaper XL".to_string(),
                kind: Some("Checkpoint".to_string()),
                versions: vec![StubRegistry::version(90, "ds.safetensors", "Checkpoint")],
            }],
        );
        let resolver = resolver_with(&temp, stub);

        let refs = [MetadataResource {
            name: Some("dreamshaper".to_string()),
            ..Default::default()
        }];
        let outcome = resolver.resolve(&refs).await;
        let r = &outcome.resources[0];
        assert!(r.resolved);
        assert_eq!(r.resolve_method, ResolveMethod::ByName);
        assert_eq!(r.model_id, Some(9));
    }

    #[tokio::test]
    async fn test_resolve_by_name_ambiguous_is_unresolved() {
        let temp = TempDir::new().unwrap();
        let stub = StubRegistry::default();
        stub.search.lock().insert(
            "detail".to_string(),
            vec![
                ModelSummary {
                    id: 1,
                    name: "Detail Tweaker".to_string(),
                    kind: None,
                    versions: vec![StubRegistry::version(10, "a.safetensors", "LORA")],
                },
                ModelSummary {
                    id: 2,
                    name: "Detail Slider".to_string(),
                    kind: None,
                    versions: vec![StubRegistry::version(20, "b.safetensors", "LORA")],
                },
            ],
        );
        let resolver = resolver_with(&temp, stub);

        let refs = [MetadataResource {
            name: Some("detail".to_string()),
            ..Default::default()
        }];
        let outcome = resolver.resolve(&refs).await;
        assert_eq!(outcome.unresolved_count, 1);
        let r = &outcome.resources[0];
        assert!(!r.resolved);
        assert_eq!(r.error.as_deref(), Some(AMBIGUOUS_OR_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_registry_error_recorded_batch_continues() {
        let temp = TempDir::new().unwrap();
        let stub = StubRegistry::default();
        *stub.fail_hash.lock() = true;
        stub.by_id
            .lock()
            .insert(5, StubRegistry::version(5, "ok.safetensors", "Checkpoint"));
        let resolver = resolver_with(&temp, stub);

        let refs = [
            MetadataResource {
                hash: Some("deadbeef".to_string()),
                ..Default::default()
            },
            MetadataResource {
                model_version_id: Some(5),
                ..Default::default()
            },
        ];
        let outcome = resolver.resolve(&refs).await;
        assert_eq!(outcome.resolved_count, 1);
        assert_eq!(outcome.unresolved_count, 1);
        assert!(outcome.resources[0].error.as_deref().unwrap().contains("connection refused"));
        assert!(outcome.resources[1].resolved);
    }

    #[tokio::test]
    async fn test_dedup_by_version_id_first_wins() {
        let temp = TempDir::new().unwrap();
        let stub = StubRegistry::default();
        stub.by_id
            .lock()
            .insert(42, StubRegistry::version(42, "x.safetensors", "LORA"));
        let resolver = resolver_with(&temp, stub);

        let refs = [
            MetadataResource {
                model_version_id: Some(42),
                weight: Some(0.4),
                ..Default::default()
            },
            MetadataResource {
                model_version_id: Some(42),
                weight: Some(0.9),
                ..Default::default()
            },
        ];
        let outcome = resolver.resolve(&refs).await;
        // Counts cover the pre-dedup set.
        assert_eq!(outcome.resolved_count + outcome.unresolved_count, 2);
        assert_eq!(outcome.resources.len(), 1);
        // Weights are not summed; the first occurrence wins.
        assert_eq!(outcome.resources[0].weight, Some(0.4));
    }

    #[tokio::test]
    async fn test_already_downloaded_detected() {
        let temp = TempDir::new().unwrap();
        let lora_dir = temp.path().join("loras");
        std::fs::create_dir_all(&lora_dir).unwrap();
        std::fs::write(lora_dir.join("x.safetensors"), b"bytes").unwrap();

        let stub = StubRegistry::default();
        stub.by_id
            .lock()
            .insert(42, StubRegistry::version(42, "x.safetensors", "LORA"));
        let resolver = resolver_with(&temp, stub);

        let refs = [MetadataResource {
            model_version_id: Some(42),
            ..Default::default()
        }];
        let outcome = resolver.resolve(&refs).await;
        let r = &outcome.resources[0];
        assert!(r.resolved);
        assert!(r.already_downloaded);
        assert!(!r.needs_download());
    }
}
