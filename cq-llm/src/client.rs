use crate::error::{LlmError, Result};
use crate::retry::{HttpOutcome, RetryPolicy, send_with_retry};
use crate::types::{ChatCompletion, ChatUsage, ModelInfo, WireMessage};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl ChatClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, api_key: &str, retry: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One chat-completion round trip through the retry transport.
    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat_completion(
        &self,
        messages: &[WireMessage],
        model: &str,
    ) -> Result<ChatCompletion> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "at least one message is required".to_string(),
            ));
        }
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
        });

        let outcome = send_with_retry(&self.retry, || {
            let url = url.clone();
            let body = body.clone();
            async move { self.post_json(&url, body).await }
        })
        .await?;

        if !(200..300).contains(&outcome.status) {
            return Err(LlmError::Http {
                status: outcome.status,
                body: outcome.body,
            });
        }

        let parsed: CompletionResponse = serde_json::from_str(&outcome.body)?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(LlmError::ResponseFormat(
                "completion response carried no choices".to_string(),
            ));
        };
        Ok(ChatCompletion {
            content: choice.message.content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }

    /// Fetch the model catalog, used to validate selection and cache
    /// context-window sizes.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ModelsResponse = serde_json::from_str(&body)?;
        Ok(parsed.data)
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<HttpOutcome> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;
        Ok(HttpOutcome {
            status,
            body,
            retry_after,
        })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = raw.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_response_decodes_content_and_usage() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(parsed.choices[0].message.content, "hello");
        assert_eq!(parsed.usage.expect("usage").total_tokens, 16);
    }

    #[test]
    fn completion_response_tolerates_missing_usage() {
        let body = r#"{"choices": [{"message": {"content": "x"}}]}"#;
        let parsed: CompletionResponse = serde_json::from_str(body).expect("decode");
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn models_response_decodes_catalog() {
        let body = r#"{"data": [
            {"id": "gpt-4o", "context_length": 128000},
            {"id": "small-model"}
        ]}"#;
        let parsed: ModelsResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].context_length, Some(128000));
        assert!(parsed.data[1].context_length.is_none());
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        let mut bad = reqwest::header::HeaderMap::new();
        bad.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&bad), None);
    }

    #[test]
    fn base_url_is_normalized() {
        let client = ChatClient::new("https://api.example.com/v1/", "k", RetryPolicy::default());
        assert_eq!(client.base_url(), "https://api.example.com/v1");
    }
}
