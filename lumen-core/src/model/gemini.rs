//! Google Gemini `generateContent` client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{sniff_mime_type, ModelError, VisionModel};
use crate::error::{LumenError, Result};
use crate::prompt::AnalysisMode;
use crate::transport::{FetchOptions, ResilientTransport};

pub const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Configuration for [`GeminiVisionModel`].
#[derive(Clone)]
pub struct GeminiConfig {
    /// API base URL, without trailing slash
    pub api_url: String,
    /// API key
    pub api_key: String,
    /// Model identifier
    pub model: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retries after the first attempt, for 5xx and network errors
    pub max_retries: u32,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(120),
            max_retries: 1,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Required: `GEMINI_API_KEY`
    /// Optional: `GEMINI_MODEL`, `GEMINI_API_URL`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| LumenError::Config("GEMINI_API_KEY environment variable not set".into()))?;

        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            config.model = model;
        }
        if let Ok(url) = std::env::var("GEMINI_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [RequestPart<'a>; 2],
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text { text: &'a str },
    Image { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> std::result::Result<String, ModelError> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            let reason = self
                .prompt_feedback
                .map(|f| f.to_string())
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(ModelError::EmptyResponse(reason));
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            let reason = candidate
                .finish_reason
                .unwrap_or_else(|| "empty candidate".to_string());
            return Err(ModelError::EmptyResponse(reason));
        }
        Ok(text)
    }
}

pub struct GeminiVisionModel {
    transport: ResilientTransport,
    config: GeminiConfig,
}

impl GeminiVisionModel {
    pub fn new(transport: ResilientTransport, config: GeminiConfig) -> Self {
        Self { transport, config }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.api_url, self.config.model
        )
    }
}

#[async_trait]
impl VisionModel for GeminiVisionModel {
    #[instrument(skip(self, image, prompt), fields(model = %self.config.model, bytes = image.len()))]
    async fn analyze(&self, image: &[u8], prompt: &str, mode: AnalysisMode) -> std::result::Result<String, ModelError> {
        let start = Instant::now();
        let request = GenerateRequest {
            contents: [Content {
                parts: [
                    RequestPart::Text { text: prompt },
                    RequestPart::Image {
                        inline_data: InlineData {
                            mime_type: sniff_mime_type(image),
                            data: base64::engine::general_purpose::STANDARD.encode(image),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: match mode {
                    AnalysisMode::Quick => 0.2,
                    AnalysisMode::Full => 0.4,
                },
            },
        };

        let url = self.endpoint();
        let options = FetchOptions {
            max_retries: self.config.max_retries,
            timeout: self.config.timeout,
            ..FetchOptions::default()
        };

        let response = self
            .transport
            .execute(&url, &options, |client| {
                client
                    .post(&url)
                    .header("x-goog-api-key", &self.config.api_key)
                    .json(&request)
            })
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(300).collect();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                    ModelError::Rejected(format!("HTTP {status}: {message}"))
                }
                _ => ModelError::Request(format!("HTTP {status}: {message}")),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Request(format!("Invalid response body: {e}")))?;
        let text = body.into_text()?;

        info!(
            latency_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "Model response received"
        );
        debug!(mode = %mode, "Generation finished");
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_redacts_key() {
        let config = GeminiConfig::new("sk-very-secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_request_shape() {
        let request = GenerateRequest {
            contents: [Content {
                parts: [
                    RequestPart::Text { text: "describe" },
                    RequestPart::Image {
                        inline_data: InlineData {
                            mime_type: "image/png",
                            data: "AAAA".into(),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: 0.2,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "describe");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(json["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn test_response_text_is_concatenated() {
        let body: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(body.into_text().unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_blocked_response_is_empty() {
        let body: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(body.into_text(), Err(ModelError::EmptyResponse(r)) if r.contains("SAFETY")));

        let body: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#).unwrap();
        assert!(matches!(body.into_text(), Err(ModelError::EmptyResponse(r)) if r == "MAX_TOKENS"));
    }
}
