//! Per-page narration (text-to-speech)
//!
//! Same fallback policy as image generation: with a provider key the
//! synthesized bytes are stored in the blob store; without one a
//! deterministic placeholder URI is returned.

use std::sync::Arc;

use crate::media::{content_key, GeneratedMedia, LocalMediaStore};
use crate::{Error, Result};

const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_FORMAT: &str = "mp3";

pub struct SpeechSynthesizer {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    store: Arc<LocalMediaStore>,
}

impl SpeechSynthesizer {
    pub fn new(api_key: Option<String>, base_url: String, store: Arc<LocalMediaStore>) -> Self {
        Self { client: reqwest::Client::new(), api_key, base_url, store }
    }

    pub async fn synthesize(
        &self,
        story_ref: &str,
        text: &str,
        voice: Option<&str>,
        format: Option<&str>,
    ) -> Result<GeneratedMedia> {
        let voice = voice.unwrap_or(DEFAULT_VOICE);
        let format = format.unwrap_or(DEFAULT_FORMAT);

        let Some(api_key) = &self.api_key else {
            return Ok(placeholder(text, voice, format));
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": "tts-1",
                "input": text,
                "voice": voice,
                "response_format": format,
            }))
            .send()
            .await
            .map_err(|e| Error::provider(None, e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(Some(status), text));
        }

        let bytes = response.bytes().await.map_err(|e| Error::provider(None, e.to_string()))?;
        let uri = self.store.put_bytes(story_ref, format, &bytes).await?;

        Ok(GeneratedMedia {
            uri,
            format: format.to_string(),
            duration_secs: None,
            metadata: serde_json::json!({ "voice": voice }),
        })
    }
}

fn placeholder(text: &str, voice: &str, format: &str) -> GeneratedMedia {
    GeneratedMedia {
        uri: format!(
            "https://placeholder.storyloom.dev/audio/{}.{}",
            content_key(text.as_bytes()),
            format
        ),
        format: format.to_string(),
        duration_secs: None,
        metadata: serde_json::json!({ "placeholder": true, "voice": voice }),
    }
}
