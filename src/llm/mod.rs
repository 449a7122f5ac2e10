//! Text generation backends for advisories.
//!
//! `LlmProvider` is an enum over the concrete providers; `build` picks one
//! from settings at startup. Remote failures never reach callers of
//! [`LlmProvider::advise`]: they are logged and answered by the local rules.

pub mod gemini;
pub mod local;

use crate::settings::Llm as LlmCfg;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider is missing an API key")]
    MissingApiKey,
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned no text")]
    EmptyResponse,
}

/// What the advisory prompt is built from
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdvisoryContext {
    pub district: String,
    pub crops: Vec<String>,
    pub language: String,
    pub rain_24h_mm: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub temp_max_c: Option<f64>,
    pub pest_alert: bool,
}

impl AdvisoryContext {
    pub fn prompt(&self) -> String {
        let crops = if self.crops.is_empty() {
            "unspecified crops".to_string()
        } else {
            self.crops.join(", ")
        };
        let mut prompt = format!(
            "You are a farming expert for Kerala. Write one short, practical advisory \
             for a farmer in {} district growing {}.",
            self.district, crops
        );
        if let Some(rain) = self.rain_24h_mm {
            prompt.push_str(&format!(" Expected rain in 24h: {rain} mm."));
        }
        if let Some(wind) = self.wind_speed_ms {
            prompt.push_str(&format!(" Wind speed: {wind} m/s."));
        }
        if let Some(t) = self.temp_max_c {
            prompt.push_str(&format!(" Maximum temperature: {t} C."));
        }
        if self.pest_alert {
            prompt.push_str(" There are recent pest reports nearby.");
        }
        if self.language.starts_with("ml") {
            prompt.push_str(" Respond in Malayalam.");
        }
        prompt
    }
}

#[derive(Debug, Clone)]
pub enum LlmProvider {
    Local(local::LocalProvider),
    Gemini(gemini::GeminiProvider),
}

impl LlmProvider {
    pub fn name(&self) -> &'static str {
        match self {
            LlmProvider::Local(_) => "local",
            LlmProvider::Gemini(_) => "gemini",
        }
    }

    /// Free-form completion of `prompt`
    pub async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        match self {
            LlmProvider::Local(p) => Ok(p.complete(prompt)),
            LlmProvider::Gemini(p) => p.complete(prompt).await,
        }
    }

    /// A general advisory for the context. Falls back to the local rules on
    /// any remote error.
    pub async fn advise(&self, ctx: &AdvisoryContext) -> String {
        match self {
            LlmProvider::Local(p) => p.advise(ctx),
            LlmProvider::Gemini(p) => match p.complete(&ctx.prompt()).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(provider = "gemini", error = %e, "LLM advisory failed, using local rules");
                    local::LocalProvider.advise(ctx)
                }
            },
        }
    }
}

/// Construct the configured provider
pub fn build(cfg: &LlmCfg) -> Result<LlmProvider, ProviderError> {
    match cfg.provider.to_ascii_lowercase().as_str() {
        "local" | "dummy" => Ok(LlmProvider::Local(local::LocalProvider)),
        "gemini" => {
            let api_key = cfg.api_key.clone().ok_or(ProviderError::MissingApiKey)?;
            let p = gemini::GeminiProvider::new(
                cfg.base_url.clone(),
                cfg.model.clone(),
                api_key,
                cfg.timeout_secs,
            )?;
            Ok(LlmProvider::Gemini(p))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}
