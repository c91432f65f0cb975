//! Media generation and storage
//!
//! Per-page image and audio generation, optional video composition, and a
//! local blob store for produced bytes. Image and audio handlers fall back
//! to deterministic placeholder URIs when no provider is configured; that
//! is acceptable behavior, not an error.

pub mod audio;
pub mod image;
pub mod store;
pub mod video;

pub use audio::SpeechSynthesizer;
pub use image::ImageGenerator;
pub use store::LocalMediaStore;
pub use video::{VideoComposer, VideoInput};

use serde::{Deserialize, Serialize};

/// What a media handler hands back to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedMedia {
    pub uri: String,
    pub format: String,
    pub duration_secs: Option<f64>,
    pub metadata: serde_json::Value,
}

/// Short content hash used for placeholder URIs and blob file names
pub(crate) fn content_key(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}
