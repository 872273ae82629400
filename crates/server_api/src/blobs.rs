use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use shared::domain::Attachment;
use url::Url;

pub const UPLOAD_PATH_PREFIX: &str = "/uploads/";

/// Backing storage for attachment blobs. Uploads happen elsewhere; the core
/// only removes blobs of recalled messages.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns `Ok(false)` when this store holds nothing for the attachment.
    async fn delete(&self, attachment: &Attachment) -> io::Result<bool>;
}

/// Serves `/uploads/<name>` URLs from a local directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local file behind `url`, or `None` for URLs this store does not own.
    pub fn path_for(&self, url: &str) -> Option<PathBuf> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse("http://localhost/").ok()?.join(url).ok()?
            }
            Err(_) => return None,
        };
        let name = parsed.path().strip_prefix(UPLOAD_PATH_PREFIX)?;
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return None;
        }
        Some(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn delete(&self, attachment: &Attachment) -> io::Result<bool> {
        let Some(path) = self.path_for(&attachment.url) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
#[path = "tests/blobs_tests.rs"]
mod tests;
