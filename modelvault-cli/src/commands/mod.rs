//! CLI subcommands.

pub mod download;
pub mod fetch;
pub mod resolve;
pub mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use modelvault::registry::HttpRegistry;
use modelvault::resolver::Resolver;
use modelvault::store::ModelStore;

/// Shared command context built from the global CLI flags.
pub struct Context {
    pub api_key: Option<String>,
    pub models_dir: PathBuf,
}

impl Context {
    pub fn new(api_key: Option<String>, models_dir: Option<PathBuf>) -> Self {
        Self {
            api_key,
            models_dir: models_dir.unwrap_or_else(|| PathBuf::from("models")),
        }
    }

    pub fn registry(&self) -> Arc<HttpRegistry> {
        Arc::new(HttpRegistry::new(self.api_key.clone()))
    }

    pub fn resolver(&self, registry: Arc<HttpRegistry>) -> Arc<Resolver<HttpRegistry>> {
        Arc::new(Resolver::new(registry, ModelStore::new(&self.models_dir)))
    }
}
