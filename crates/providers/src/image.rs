//! OpenAI-style image generation adapter.
//!
//! Posts the paint-director's prompt to `/images/generations` and returns
//! the hosted URL of the first result. Downloading and re-hosting artifacts
//! is the persistence collaborator's concern.

use async_trait::async_trait;
use serde::Deserialize;
use storyloom_core::adapter::{ImageAdapter, ImageRef};
use storyloom_core::AdapterError;
use tracing::{debug, warn};

/// Configuration for the image backend.
#[derive(Debug, Clone)]
pub struct ImageEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Requested output size, e.g. "1024x1024"
    pub size: String,
}

/// OpenAI-compatible image generation adapter.
pub struct OpenAiImageAdapter {
    endpoint: ImageEndpoint,
    client: reqwest::Client,
}

impl OpenAiImageAdapter {
    pub fn new(endpoint: ImageEndpoint) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(180))
            .build()
            .expect("Failed to create HTTP client");
        Self { endpoint, client }
    }
}

#[async_trait]
impl ImageAdapter for OpenAiImageAdapter {
    fn name(&self) -> &str {
        "openai-image"
    }

    async fn generate(
        &self,
        prompt: &str,
        session_id: &str,
    ) -> std::result::Result<ImageRef, AdapterError> {
        let url = format!(
            "{}/images/generations",
            self.endpoint.base_url.trim_end_matches('/')
        );

        debug!(session = %session_id, prompt_len = prompt.len(), "Requesting image generation");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "model": self.endpoint.model,
                "prompt": prompt,
                "n": 1,
                "size": self.endpoint.size,
            }))
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Image generation failed");
            return Err(AdapterError::ApiError {
                status_code: status,
                message: body,
            });
        }

        let parsed: ImageApiResponse =
            response.json().await.map_err(|e| AdapterError::ApiError {
                status_code: 200,
                message: format!("Failed to parse image response: {e}"),
            })?;

        parsed
            .data
            .into_iter()
            .next()
            .and_then(|d| d.url)
            .map(|url| ImageRef { url })
            .ok_or_else(|| AdapterError::ApiError {
                status_code: 200,
                message: "No image in response".into(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct ImageApiResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_response() {
        let data = r#"{"created": 1, "data": [{"url": "https://cdn.example.com/img.png"}]}"#;
        let parsed: ImageApiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.data[0].url.as_deref(),
            Some("https://cdn.example.com/img.png")
        );
    }

    #[test]
    fn parse_empty_image_response() {
        let parsed: ImageApiResponse = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn adapter_has_a_name() {
        let adapter = OpenAiImageAdapter::new(ImageEndpoint {
            base_url: "https://api.example.com/v1".into(),
            api_key: "sk-test".into(),
            model: "dall-e-3".into(),
            size: "1024x1024".into(),
        });
        assert_eq!(adapter.name(), "openai-image");
    }
}
