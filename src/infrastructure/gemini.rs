use crate::domain::ImagePayload;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum LessonSourceError {
    #[error("API request failed: {0}")]
    RequestFailed(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The seam between analysis orchestration and the actual model
/// service: an opaque (prompt, image) -> text call. Retry and fallback
/// policy live with the caller, not here.
#[async_trait]
pub trait LessonSource: Send + Sync {
    #[must_use]
    async fn generate(&self, prompt: &str, image: &ImagePayload)
        -> Result<String, LessonSourceError>;
}

pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_keys: Vec<String>,
    active_key: AtomicUsize,
}

impl GeminiClient {
    pub fn new(
        api_keys: Vec<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, LessonSourceError> {
        let api_keys: Vec<String> = api_keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        // An unconfigured client is allowed to exist; the service keeps
        // running on the fallback lesson and /health reports it.
        if api_keys.is_empty() {
            warn!("No Gemini API keys configured; every analysis will serve the fallback lesson");
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                LessonSourceError::InvalidConfig(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model,
            api_keys,
            active_key: AtomicUsize::new(0),
        })
    }

    pub fn key_count(&self) -> usize {
        self.api_keys.len()
    }

    pub fn is_configured(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn current_key(&self) -> Option<&str> {
        if self.api_keys.is_empty() {
            return None;
        }
        Some(&self.api_keys[self.active_key.load(Ordering::Relaxed) % self.api_keys.len()])
    }

    // Each key has its own daily rate ceiling upstream, so a 429 on one
    // key says nothing about the others.
    fn rotate_key(&self) {
        if self.api_keys.len() > 1 {
            let previous = self.active_key.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Gemini key {} rate limited, rotating to key {}",
                previous % self.api_keys.len(),
                (previous + 1) % self.api_keys.len()
            );
        }
    }
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

fn extract_text(response: GenerateContentResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl LessonSource for GeminiClient {
    async fn generate(
        &self,
        prompt: &str,
        image: &ImagePayload,
    ) -> Result<String, LessonSourceError> {
        let Some(key) = self.current_key() else {
            return Err(LessonSourceError::InvalidConfig(
                "No Gemini API keys configured".to_string(),
            ));
        };

        let body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text { text: prompt },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: image.mime_type.clone(),
                            data: BASE64.encode(&image.bytes),
                        },
                    },
                ],
            }],
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model
        );
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LessonSourceError::RequestFailed(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            self.rotate_key();
            return Err(LessonSourceError::RateLimited);
        }
        if !status.is_success() {
            let error_text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LessonSourceError::RequestFailed(format!(
                "status {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| LessonSourceError::InvalidResponse(e.to_string()))?;

        extract_text(parsed)
            .ok_or_else(|| LessonSourceError::InvalidResponse("Empty model reply".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(keys: Vec<&str>) -> GeminiClient {
        GeminiClient::new(
            keys.into_iter().map(String::from).collect(),
            "gemini-2.5-flash".to_string(),
            Duration::from_secs(30),
        )
        .expect("Failed to build client")
    }

    #[test]
    fn blank_keys_leave_the_client_unconfigured() {
        let client = GeminiClient::new(
            vec!["  ".to_string(), String::new()],
            "gemini-2.5-flash".to_string(),
            Duration::from_secs(30),
        )
        .expect("Failed to build client");
        assert!(!client.is_configured());
        assert_eq!(client.key_count(), 0);
    }

    #[tokio::test]
    async fn unconfigured_client_fails_before_any_request() {
        let client = GeminiClient::new(
            Vec::new(),
            "gemini-2.5-flash".to_string(),
            Duration::from_secs(30),
        )
        .expect("Failed to build client");

        let image = ImagePayload {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        };
        let err = client
            .generate("prompt", &image)
            .await
            .expect_err("Should fail without keys");
        assert!(matches!(err, LessonSourceError::InvalidConfig(_)));
    }

    #[test]
    fn key_rotation_cycles_through_keys() {
        let client = test_client(vec!["key-a", "key-b", "key-c"]);
        assert_eq!(client.current_key(), Some("key-a"));

        client.rotate_key();
        assert_eq!(client.current_key(), Some("key-b"));
        client.rotate_key();
        assert_eq!(client.current_key(), Some("key-c"));
        client.rotate_key();
        assert_eq!(client.current_key(), Some("key-a"));
    }

    #[test]
    fn single_key_never_rotates() {
        let client = test_client(vec!["only-key"]);
        client.rotate_key();
        assert_eq!(client.current_key(), Some("only-key"));
    }

    #[test]
    fn request_body_carries_prompt_and_inline_image() {
        let body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text { text: "coach me" },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: "image/png".to_string(),
                            data: BASE64.encode(b"fake-png"),
                        },
                    },
                ],
            }],
        };

        let value = serde_json::to_value(&body).expect("Failed to serialize body");
        assert_eq!(value["contents"][0]["parts"][0]["text"], "coach me");
        assert_eq!(
            value["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            "image/png"
        );
        assert!(value["contents"][0]["parts"][1]["inlineData"]["data"].is_string());
    }

    #[test]
    fn extracts_text_from_first_candidate() {
        let raw = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "part one. "}, {"text": "part two."}]}}
            ]
        }"#;
        let parsed: GenerateContentResponse =
            serde_json::from_str(raw).expect("Failed to parse response");
        assert_eq!(extract_text(parsed).as_deref(), Some("part one. part two."));
    }

    #[test]
    fn empty_candidates_yield_none() {
        for raw in [
            r#"{}"#,
            r#"{"candidates": []}"#,
            r#"{"candidates": [{"content": null}]}"#,
            r#"{"candidates": [{"content": {"parts": [{"text": "   "}]}}]}"#,
        ] {
            let parsed: GenerateContentResponse =
                serde_json::from_str(raw).expect("Failed to parse response");
            assert!(extract_text(parsed).is_none(), "extracted from: {}", raw);
        }
    }
}
