//! # Temporary Audio Store
//!
//! Owns the transient file each transcription request writes its audio to.
//!
//! ## Lifecycle:
//! 1. **persist**: a fresh, never-reused path is created and the payload written once
//! 2. **read**: the engine opens the file by path (as many times as it likes)
//! 3. **release**: the file is deleted exactly once
//!
//! ## Naming:
//! Every file name starts with a random UUIDv4 token drawn from the OS CSPRNG,
//! so concurrent handlers never collide without needing any shared counter.
//! Files are opened with create-new semantics, which turns a collision into an
//! error instead of a silent overwrite.
//!
//! ## Cleanup guarantee:
//! [`TemporaryAudioHandle`] deletes its file when dropped unless it was already
//! released. Panics and cancelled futures therefore cannot leave audio behind.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest sanitized original file name kept in the temp file name.
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write temporary audio file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory-backed store for per-request audio files.
#[derive(Debug, Clone)]
pub struct TemporaryAudioStore {
    dir: PathBuf,
}

impl TemporaryAudioStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the backing directory if it does not exist yet.
    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Write `bytes` to a new uniquely named file.
    ///
    /// On failure any partially written file is removed before the error is
    /// returned, so the caller never has anything to clean up.
    pub async fn persist(
        &self,
        bytes: &[u8],
        extension: &str,
        original_name: Option<&str>,
    ) -> Result<TemporaryAudioHandle, StoreError> {
        let path = self.dir.join(file_name_for(extension, original_name));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Write { path: path.clone(), source })?;

        // From here on the handle owns the file; dropping it on error deletes it.
        let handle = TemporaryAudioHandle::new(path);

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(source) = written {
            let path = handle.path().to_path_buf();
            drop(file);
            self.release(handle).await;
            return Err(StoreError::Write { path, source });
        }

        debug!(path = %handle.path().display(), bytes = bytes.len(), "Persisted temporary audio");
        Ok(handle)
    }

    /// Delete the file behind `handle`.
    ///
    /// Never fails from the caller's perspective: a file that is already gone
    /// counts as released, and other I/O errors are logged.
    pub async fn release(&self, handle: TemporaryAudioHandle) {
        let path = handle.path().to_path_buf();
        if let Err(e) = handle.release().await {
            warn!(path = %path.display(), error = %e, "Failed to delete temporary audio file");
        }
    }
}

/// A transient audio file owned by exactly one request.
#[derive(Debug)]
pub struct TemporaryAudioHandle {
    path: PathBuf,
    released: bool,
}

impl TemporaryAudioHandle {
    fn new(path: PathBuf) -> Self {
        Self { path, released: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Deleting a file that no longer exists is not an error.
    pub async fn release(mut self) -> io::Result<()> {
        let result = tokio::fs::remove_file(&self.path).await;
        self.released = true;
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => {
                debug!(path = %self.path.display(), "Released temporary audio");
                Ok(())
            }
        }
    }
}

impl Drop for TemporaryAudioHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Temporary audio removed on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove temporary audio on drop"),
        }
    }
}

fn file_name_for(extension: &str, original_name: Option<&str>) -> String {
    let token = Uuid::new_v4().simple();
    let extension = sanitize(extension);
    match original_name.map(sanitize).filter(|name| !name.is_empty()) {
        Some(name) if name.to_ascii_lowercase().ends_with(&format!(".{}", extension.to_ascii_lowercase())) => {
            format!("{token}_{name}")
        }
        Some(name) => format!("{token}_{name}.{extension}"),
        None => format!("{token}.{extension}"),
    }
}

/// Keep only the final path component and a conservative character set.
fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let start = cleaned.len().saturating_sub(MAX_NAME_LEN);
    cleaned[start..].to_string()
}
