//! Google Gemini `generateContent` client.

use super::ProviderError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(
        base_url: String,
        model: String,
        api_key: String,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    pub async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let payload = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        debug!(model = %self.model, prompt_len = prompt.len(), "sending Gemini request");
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(model = %self.model, error = %e, "Gemini request failed (transport)");
                ProviderError::Request(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Gemini returned an error status");
            return Err(ProviderError::Request(format!("HTTP {status}")));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Request(format!("invalid response body: {e}")))?;
        body.text().ok_or(ProviderError::EmptyResponse)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}
