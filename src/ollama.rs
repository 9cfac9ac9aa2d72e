//! Ollama-backed implementation of the inference capabilities.
//!
//! Ollama is the runtime the system is built around locally: it loads model
//! weights on first use, keeps one model resident, and evicts on demand —
//! which is exactly the behaviour the [`crate::gate::ResourceGate`] arbitrates
//! above it. This adapter speaks the native REST API: `/api/chat` for both
//! vision and text inference (vision requests attach the page PNG as a
//! base64 image), `/api/tags` for the installed-model catalog.
//!
//! The rasterizer is *not* implemented here; page rendering is a separate
//! external collaborator.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::capability::{
    classify_capability, CapabilityCatalog, CapabilityError, CapabilityInfo, PageImage,
    TextCapability, VisionCapability,
};

/// Default local Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Generous per-request bound: a cold model load plus a dense page can take
/// minutes on consumer hardware.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OllamaClient {
    client: Client,
    base_url: String,
    max_tokens: usize,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client build never fails with valid TLS config");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_tokens: 4096,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn chat(&self, body: serde_json::Value) -> Result<String, CapabilityError> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CapabilityError::new(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CapabilityError::new(format!(
                "ollama returned {status}: {text}"
            )));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::new(format!("ollama response parse error: {e}")))?;

        Ok(completion.message.content.trim().to_string())
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl VisionCapability for OllamaClient {
    async fn transcribe_page(
        &self,
        model: &str,
        page: &PageImage,
        instructions: &str,
    ) -> Result<String, CapabilityError> {
        let b64 = general_purpose::STANDARD.encode(&page.png);
        debug!(model, page = page.page_num, png_bytes = page.png.len(), "vision request");

        let body = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": instructions,
                "images": [b64],
            }],
            "stream": false,
        });

        let markdown = self
            .chat(body)
            .await
            .map_err(|e| CapabilityError::new(format!("page {}: {e}", page.page_num)))?;
        if markdown.is_empty() {
            return Err(CapabilityError::new(format!(
                "page {}: model returned empty transcription",
                page.page_num
            )));
        }
        Ok(markdown)
    }
}

#[async_trait]
impl TextCapability for OllamaClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, CapabilityError> {
        debug!(model, prompt_bytes = prompt.len(), "text request");

        let body = json!({
            "model": model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a professional academic paper analysis assistant.",
                },
                { "role": "user", "content": prompt },
            ],
            "stream": false,
            "options": {
                "num_predict": self.max_tokens,
                "temperature": 0.7,
                "top_p": 0.9,
            },
        });

        self.chat(body).await
    }
}

#[async_trait]
impl CapabilityCatalog for OllamaClient {
    async fn list(&self) -> Result<Vec<CapabilityInfo>, CapabilityError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CapabilityError::new(format!("cannot reach ollama: {e}")))?;

        if !response.status().is_success() {
            return Err(CapabilityError::new(format!(
                "ollama returned {} listing models",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::new(format!("ollama tags parse error: {e}")))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let families = m
                    .details
                    .map(|d| d.families)
                    .unwrap_or_default();
                let kind = classify_capability(&m.name, &families);
                CapabilityInfo {
                    name: m.name,
                    size_bytes: m.size,
                    kind,
                }
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Deserialize)]
struct TagDetails {
    #[serde(default)]
    families: Vec<String>,
}
