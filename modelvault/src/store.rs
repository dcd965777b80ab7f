//! Filesystem locator for the local model library.
//!
//! `ModelStore` owns the models root directory and answers two questions
//! for the resolver: where does a file of a given kind belong, and does a
//! matching file already exist? Existence checks are stat-only; content
//! is verified on download completion, never here.

use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;

/// Errors raised by target-path computation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filename contains path separators, `..`, or is empty.
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
}

/// Locator for per-kind model directories under a single root.
#[derive(Clone, Debug)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    /// Create a store rooted at the given models directory.
    ///
    /// The directory does not have to exist yet; it is created lazily
    /// when the first download commits.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The models root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a model kind, e.g. `<root>/loras`.
    pub fn dir_for(&self, kind: crate::resolver::ModelKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Full destination path for a file of the given kind.
    ///
    /// The filename must be a bare name; anything that could traverse
    /// out of the kind directory is rejected.
    pub fn target_path(
        &self,
        kind: crate::resolver::ModelKind,
        filename: &str,
    ) -> Result<PathBuf, StoreError> {
        sanitize_filename(filename)?;
        Ok(self.dir_for(kind).join(filename))
    }

    /// Look for an existing file with this name anywhere under the kind
    /// directory (users often sort models into subfolders by hand).
    ///
    /// Returns the first match. Stat-only; the file's content is not
    /// inspected.
    pub fn find_existing(
        &self,
        kind: crate::resolver::ModelKind,
        filename: &str,
    ) -> Result<Option<PathBuf>, StoreError> {
        sanitize_filename(filename)?;
        let dir = self.dir_for(kind);
        if !dir.exists() {
            return Ok(None);
        }

        let direct = dir.join(filename);
        if direct.is_file() {
            return Ok(Some(direct));
        }

        let pattern = format!("{}/**/{}", dir.display(), filename);
        if let Ok(paths) = glob(&pattern) {
            for entry in paths.flatten() {
                if entry.is_file() {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }
}

/// Reject filenames that are empty or could escape the target directory.
fn sanitize_filename(filename: &str) -> Result<(), StoreError> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(StoreError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}
