//! Streaming checksum verification and atomic promotion.
//!
//! Downloads land in a temp file next to their destination. The
//! verifier hashes the temp file in fixed-size chunks, compares against
//! the expected digest, and only then renames it into place. A corrupt
//! temp file is deleted, never promoted, so the destination path either
//! holds a fully verified file or nothing at all.

use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::DownloadError;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => Err(format!("unsupported hash algorithm '{other}'")),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Verifies downloaded files and promotes them to their destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier {
    algorithm: HashAlgorithm,
}

impl Verifier {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Calculate the checksum of a file, streaming in fixed-size chunks.
    ///
    /// Returns the lowercase hexadecimal digest.
    pub async fn hash_file(&self, path: &Path) -> Result<String, DownloadError> {
        self.hash_file_cancellable(path, &CancellationToken::new())
            .await
    }

    /// Like [`Self::hash_file`] but observes the token between chunks.
    async fn hash_file_cancellable(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let mut file = File::open(path).await.map_err(|e| DownloadError::Disk {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut hasher = Hasher::new(self.algorithm);
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let bytes_read = file
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::Disk {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize_hex())
    }

    /// Verify the temp file against an expected digest and rename it to
    /// its final destination.
    ///
    /// With no expected digest the file is promoted unverified. On a
    /// mismatch the temp file is deleted and the destination is left
    /// untouched. Cancellation is observed between hash chunks and
    /// discards the temp file; once hashing completes the rename happens
    /// regardless, so a cancel that loses the race sees a completed file.
    pub async fn verify_and_promote(
        &self,
        temp_path: &Path,
        final_path: &Path,
        expected: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if let Some(expected) = expected {
            let actual = match self.hash_file_cancellable(temp_path, cancel).await {
                Ok(actual) => actual,
                Err(e) => {
                    // No error path may leave a .part file behind.
                    if let Err(rm) = tokio::fs::remove_file(temp_path).await {
                        warn!(path = %temp_path.display(), error = %rm, "failed to remove temp file");
                    }
                    return Err(e);
                }
            };
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(
                    path = %temp_path.display(),
                    expected,
                    actual,
                    "checksum mismatch, discarding download"
                );
                if let Err(e) = tokio::fs::remove_file(temp_path).await {
                    warn!(path = %temp_path.display(), error = %e, "failed to remove corrupt temp file");
                }
                return Err(DownloadError::ChecksumMismatch {
                    path: final_path.to_path_buf(),
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
            debug!(path = %final_path.display(), algorithm = self.algorithm.as_str(), "checksum verified");
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::Disk {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        tokio::fs::rename(temp_path, final_path)
            .await
            .map_err(|e| DownloadError::Disk {
                path: final_path.to_path_buf(),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    // SHA-256 of "hello world".
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn test_hash_file_sha256() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let verifier = Verifier::default();
        assert_eq!(verifier.hash_file(&path).await.unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_verify_and_promote_success() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("model.safetensors.part");
        let dest = temp.path().join("model.safetensors");
        std::fs::write(&part, b"hello world").unwrap();

        let verifier = Verifier::default();
        verifier
            .verify_and_promote(&part, &dest, Some(HELLO_SHA256), &CancellationToken::new())
            .await
            .unwrap();

        assert!(dest.exists());
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_mismatch_deletes_temp_and_never_promotes() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("model.safetensors.part");
        let dest = temp.path().join("model.safetensors");
        std::fs::write(&part, b"corrupted bytes").unwrap();

        let verifier = Verifier::default();
        let err = verifier
            .verify_and_promote(&part, &dest, Some(HELLO_SHA256), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_expected_hash_compare_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("f.part");
        let dest = temp.path().join("f");
        std::fs::write(&part, b"hello world").unwrap();

        let verifier = Verifier::default();
        verifier
            .verify_and_promote(
                &part,
                &dest,
                Some(&HELLO_SHA256.to_ascii_uppercase()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_no_expected_hash_promotes_unverified() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("f.part");
        let dest = temp.path().join("f");
        std::fs::write(&part, b"anything").unwrap();

        let verifier = Verifier::default();
        verifier
            .verify_and_promote(&part, &dest, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_promote_creates_destination_directory() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("m.safetensors.part");
        let dest = temp.path().join("checkpoints").join("sd15").join("m.safetensors");
        std::fs::write(&part, b"hello world").unwrap();

        let verifier = Verifier::default();
        verifier
            .verify_and_promote(&part, &dest, Some(HELLO_SHA256), &CancellationToken::new())
            .await
            .unwrap();
        assert!(dest.exists());
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_read_error_during_verify_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("gone.part");
        let dest = temp.path().join("gone");

        let verifier = Verifier::default();
        let err = verifier
            .verify_and_promote(&part, &dest, Some(HELLO_SHA256), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Disk { .. }));
        assert!(!part.exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_during_verify_discards_temp() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("f.part");
        let dest = temp.path().join("f");
        std::fs::write(&part, b"hello world").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let verifier = Verifier::default();
        let err = verifier
            .verify_and_promote(&part, &dest, Some(HELLO_SHA256), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!dest.exists());
        assert!(!part.exists());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(HashAlgorithm::from_str("SHA-256").unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::from_str("sha512").unwrap(), HashAlgorithm::Sha512);
        assert!(HashAlgorithm::from_str("md5").is_err());
    }
}
