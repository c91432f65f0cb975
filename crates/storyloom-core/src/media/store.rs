//! Local blob store
//!
//! Produced media bytes land under the configured upload directory, named
//! by content hash, grouped per story. The returned URI joins the public
//! base URL with the relative path; serving the directory is the hosting
//! layer's concern.

use std::path::{Path, PathBuf};

use crate::config::MediaConfig;
use crate::media::content_key;
use crate::{Error, Result};

pub struct LocalMediaStore {
    root: PathBuf,
    base_url: String,
}

impl LocalMediaStore {
    pub fn new(config: &MediaConfig) -> Result<Self> {
        let root = PathBuf::from(&config.upload_dir);
        std::fs::create_dir_all(&root)?;

        Ok(Self { root, base_url: config.public_base_url.trim_end_matches('/').to_string() })
    }

    /// Write bytes and return the public URI
    pub async fn put_bytes(
        &self,
        story_ref: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let file_name = format!("{}.{}", content_key(bytes), extension);
        let dir = self.root.join(sanitize(story_ref));
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(&file_name);
        tokio::fs::write(&path, bytes).await?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Stored media blob");

        Ok(format!("{}/{}/{}", self.base_url, sanitize(story_ref), file_name))
    }

    /// Move an already-produced file (e.g. composer output) into the store
    pub async fn put_file(&self, story_ref: &str, source: &Path) -> Result<String> {
        let bytes = tokio::fs::read(source).await.map_err(|e| {
            Error::media(format!("cannot read {}: {}", source.display(), e))
        })?;

        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();

        self.put_bytes(story_ref, &extension, &bytes).await
    }
}

/// Keep story refs path-safe
fn sanitize(story_ref: &str) -> String {
    story_ref
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
