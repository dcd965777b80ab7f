//! ModelVault - resolve and download generative model artifacts.
//!
//! Given image generation metadata, this library identifies the model
//! files the image was made with (checkpoints, LoRAs, VAEs,
//! embeddings), matches them against a model registry, and downloads
//! the missing ones into a local model store with checksum
//! verification, bounded concurrency, and live progress events.
//!
//! The main entry points:
//! - [`metadata::fetch_metadata`] pulls generation metadata for an image.
//! - [`resolver::Resolver`] matches metadata references to downloadable
//!   artifacts.
//! - [`downloads::DownloadManager`] runs the downloads.
//! - [`api::router`] exposes the whole pipeline over HTTP.

pub mod api;
pub mod config;
pub mod downloads;
pub mod metadata;
pub mod registry;
pub mod resolver;
pub mod store;

pub use config::DownloadConfig;
pub use downloads::{DownloadManager, TaskId, TaskStatus};
pub use metadata::{Metadata, MetadataResource};
pub use registry::{HttpRegistry, ModelRegistry};
pub use resolver::{ModelKind, Resolver, Resource};
pub use store::ModelStore;
