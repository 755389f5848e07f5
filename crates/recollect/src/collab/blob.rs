use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::collab::{BlobStore, content_hash};
use crate::error::{RecollectError, Result};

/// Content-addressed blob store on the local filesystem
///
/// Blob ids are the hex SHA-256 of the content, stored as
/// `<root>/<first two hex chars>/<id>`. Uploading the same bytes twice
/// yields the same id and a single file.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            RecollectError::Storage(format!(
                "Failed to create blob directory {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, blob_id: &str) -> Result<PathBuf> {
        if blob_id.len() < 3 || !blob_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RecollectError::Validation(format!(
                "Invalid blob id '{blob_id}'"
            )));
        }
        Ok(self.root.join(&blob_id[..2]).join(blob_id))
    }
}

fn unavailable(e: std::io::Error) -> RecollectError {
    RecollectError::unavailable("blob-store", e.to_string())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, content: Bytes) -> Result<String> {
        let blob_id = content_hash(&content);
        let path = self.path_for(&blob_id)?;

        if tokio::fs::try_exists(&path).await.map_err(unavailable)? {
            debug!(blob_id = %blob_id, "Blob already stored");
            return Ok(blob_id);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
        }

        // Write to a sibling temp file so readers never see a partial blob
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &content).await.map_err(unavailable)?;
        tokio::fs::rename(&tmp, &path).await.map_err(unavailable)?;

        debug!(blob_id = %blob_id, bytes = content.len(), "Stored blob");
        Ok(blob_id)
    }

    async fn retrieve(&self, blob_id: &str) -> Result<Bytes> {
        let path = self.path_for(blob_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(RecollectError::NotFound(format!("blob {blob_id}")))
            }
            Err(e) => Err(unavailable(e)),
        }
    }
}
