//! Gemini chat provider.
//!
//! Text generation against Google's Gemini API, buffered or streamed over
//! SSE (`alt=sse`).

use super::{
    ChatProvider, FinishReason, GenerationRequest, ProviderError, ProviderResponse,
    ProviderStream, StreamChunk,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Gemini API base URL.
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

pub struct GeminiChatProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiChatProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            GEMINI_API_BASE, self.config.model, method, self.config.api_key
        )
    }

    fn build_request(&self, request: &GenerationRequest) -> GenerateContentRequest {
        let mut parts: Vec<ContentPart> = request
            .attachments
            .iter()
            .map(|attachment| ContentPart {
                text: format!("[Attachment: {}]", attachment),
            })
            .collect();
        parts.push(ContentPart {
            text: request.prompt.clone(),
        });

        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![ContentPart {
                    text: format!(
                        "Reply in the language with code '{}'.",
                        request.language
                    ),
                }],
            }),
        }
    }

    async fn post(
        &self,
        url: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited);
            }

            return Err(ProviderError::ApiError(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for GeminiChatProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(request);

        tracing::debug!(
            model = %self.config.model,
            prompt_len = request.prompt.len(),
            attachments = request.attachments.len(),
            "Sending request to Gemini API"
        );

        let response = self.post(&self.api_url("generateContent"), &body).await?;

        let api_response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;

        let candidate = api_response.candidates.first();
        let finish_reason =
            FinishReason::from_gemini(candidate.and_then(|c| c.finish_reason.as_deref()));

        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::ContentFiltered);
        }

        let text: String = candidate
            .and_then(|c| c.content.as_ref())
            .map(|content| content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let usage = api_response.usage_metadata.unwrap_or_default();

        Ok(ProviderResponse {
            text,
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream, ProviderError> {
        let body = self.build_request(request);
        let url = format!("{}&alt=sse", self.api_url("streamGenerateContent"));

        tracing::debug!(
            model = %self.config.model,
            prompt_len = request.prompt.len(),
            "Starting streaming request to Gemini API"
        );

        let response = self.post(&url, &body).await?;

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut input_tokens = 0i32;
            let mut output_tokens = 0i32;
            let mut finish_reason = FinishReason::Complete;

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::NetworkError(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(event_end) = buffer.find("\n\n") {
                    let event = buffer[..event_end].to_string();
                    buffer.drain(..event_end + 2);

                    let Some(data) = event.trim_start().strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(response) = serde_json::from_str::<GenerateContentResponse>(data)
                    else {
                        tracing::debug!("Skipping unparseable Gemini SSE event");
                        continue;
                    };

                    if let Some(usage) = &response.usage_metadata {
                        input_tokens = usage.prompt_token_count.unwrap_or(input_tokens);
                        output_tokens = usage.candidates_token_count.unwrap_or(output_tokens);
                    }

                    let Some(candidate) = response.candidates.first() else {
                        continue;
                    };

                    if let Some(content) = &candidate.content {
                        for part in &content.parts {
                            if !part.text.is_empty()
                                && tx.send(Ok(StreamChunk::Text(part.text.clone()))).await.is_err()
                            {
                                // Receiver gone; client disconnected.
                                return;
                            }
                        }
                    }

                    if candidate.finish_reason.is_some() {
                        finish_reason =
                            FinishReason::from_gemini(candidate.finish_reason.as_deref());
                    }
                }
            }

            if finish_reason == FinishReason::ContentFilter {
                let _ = tx.send(Err(ProviderError::ContentFiltered)).await;
                return;
            }

            let _ = tx
                .send(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason,
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as ProviderStream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        }

        let url = format!("{}/models?key={}", GEMINI_API_BASE, self.config.api_key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::ApiError(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }
}

// Gemini API request/response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiChatProvider {
        GeminiChatProvider::new(GeminiConfig {
            api_key: "test-key".to_string(),
            model: "gemini-2.0-flash".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_request_carries_language_and_attachments() {
        let body = provider().build_request(&GenerationRequest {
            prompt: "hola".to_string(),
            language: "es".to_string(),
            attachments: vec!["menu.pdf".to_string()],
        });

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "[Attachment: menu.pdf]");
        assert_eq!(json["contents"][0]["parts"][1]["text"], "hola");
        assert!(json["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("'es'"));
    }

    #[test]
    fn test_parses_streamed_event_without_content() {
        let data = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3}}"#;
        let response: GenerateContentResponse = serde_json::from_str(data).unwrap();
        assert!(response.candidates[0].content.is_none());
        assert_eq!(
            response.usage_metadata.unwrap().prompt_token_count,
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_health_check_requires_key() {
        let provider = GeminiChatProvider::new(GeminiConfig {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
        })
        .unwrap();
        assert!(matches!(
            provider.health_check().await,
            Err(ProviderError::NotConfigured(_))
        ));
    }
}
