//! Per-page image generation
//!
//! Calls the configured image provider when a key is present; otherwise
//! succeeds with a deterministic placeholder URL derived from the prompt,
//! so unconfigured environments still complete their pipelines.

use serde::Deserialize;

use crate::media::{content_key, GeneratedMedia};
use crate::{Error, Result};

const DEFAULT_SIZE: &str = "1024x1024";

pub struct ImageGenerator {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl ImageGenerator {
    pub fn new(api_key: Option<String>, base_url: String) -> Self {
        Self { client: reqwest::Client::new(), api_key, base_url }
    }

    pub async fn generate(&self, prompt: &str, size: Option<&str>) -> Result<GeneratedMedia> {
        let size = size.unwrap_or(DEFAULT_SIZE);

        let Some(api_key) = &self.api_key else {
            return Ok(placeholder(prompt, size));
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "prompt": prompt,
                "n": 1,
                "size": size,
            }))
            .send()
            .await
            .map_err(|e| Error::provider(None, e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(Some(status), text));
        }

        let body: ImageResponse = response
            .json()
            .await
            .map_err(|e| Error::provider(None, format!("malformed image body: {}", e)))?;

        let url = body
            .data
            .into_iter()
            .next()
            .map(|d| d.url)
            .ok_or_else(|| Error::provider(None, "image response had no data"))?;

        Ok(GeneratedMedia {
            uri: url,
            format: "png".to_string(),
            duration_secs: None,
            metadata: serde_json::json!({ "size": size }),
        })
    }
}

fn placeholder(prompt: &str, size: &str) -> GeneratedMedia {
    GeneratedMedia {
        uri: format!(
            "https://placeholder.storyloom.dev/images/{}.png",
            content_key(prompt.as_bytes())
        ),
        format: "png".to_string(),
        duration_secs: None,
        metadata: serde_json::json!({ "placeholder": true, "size": size }),
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    url: String,
}
