use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::warn;

use task_core::{Error, Result};
use task_observability::redact_text;

/// A single role-tagged message in a structured-output request (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Inputs to a single `LlmClient::complete` call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// JSON schema the reply must structurally satisfy; checked by required
    /// top-level keys rather than a full JSON-Schema validator (§4.2 notes).
    pub schema: Value,
    pub max_tokens: u32,
    pub temperature: f32,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub default_model: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete_raw(&self, request: &CompletionRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

/// `reload`-able set of configured providers.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    pub fn new(openai: Option<ProviderSettings>, anthropic: Option<ProviderSettings>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(build_providers(openai, anthropic))),
        }
    }

    pub async fn reload(&self, openai: Option<ProviderSettings>, anthropic: Option<ProviderSettings>) {
        *self.providers.write().await = build_providers(openai, anthropic);
    }

    async fn first(&self) -> Arc<dyn Provider> {
        self.providers
            .read()
            .await
            .first()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoneProvider))
    }
}

fn build_providers(
    openai: Option<ProviderSettings>,
    anthropic: Option<ProviderSettings>,
) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    if let Some(settings) = openai {
        providers.push(Arc::new(OpenAiProvider::new(settings)));
    }
    if let Some(settings) = anthropic {
        providers.push(Arc::new(AnthropicProvider::new(settings)));
    }
    if providers.is_empty() {
        providers.push(Arc::new(NoneProvider));
    }
    providers
}

struct OpenAiProvider {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAiProvider {
    fn new(settings: ProviderSettings) -> Self {
        Self {
            base_url: settings
                .base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: settings.api_key,
            default_model: settings.default_model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "openai".to_string(),
            default_model: self.default_model.clone(),
        }
    }

    async fn complete_raw(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&serde_json::json!({
            "model": self.default_model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "response_format": {"type": "json_object"},
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("openai request failed with status {status}"));
            anyhow::bail!(detail);
        }
        extract_text(&value).ok_or_else(|| anyhow::anyhow!("openai returned no completion content"))
    }
}

struct AnthropicProvider {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl AnthropicProvider {
    fn new(settings: ProviderSettings) -> Self {
        Self {
            base_url: settings
                .base_url
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            api_key: settings.api_key,
            default_model: settings
                .default_model
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            default_model: self.default_model.clone(),
        }
    }

    async fn complete_raw(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let url = format!("{}/messages", self.base_url);
        let mut req = self.client.post(url).json(&serde_json::json!({
            "model": self.default_model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": request.messages,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.header("x-api-key", api_key).header("anthropic-version", "2023-06-01");
        }
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("anthropic request failed with status {status}"));
            anyhow::bail!(detail);
        }
        value
            .get("content")
            .and_then(|v| v.as_array())
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("anthropic returned no completion content"))
    }
}

/// No provider configured: always fails `Unavailable`. Gives the pipeline a
/// real fallback target instead of panicking when `llm.provider = none`.
struct NoneProvider;

#[async_trait]
impl Provider for NoneProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "none".to_string(),
            default_model: String::new(),
        }
    }

    async fn complete_raw(&self, _request: &CompletionRequest) -> anyhow::Result<String> {
        anyhow::bail!("no LLM provider configured")
    }
}

fn extract_text(value: &Value) -> Option<String> {
    value
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

fn extract_error(value: &Value) -> Option<String> {
    value.get("error")?.get("message")?.as_str().map(str::to_string)
}

/// Executes a single structured-output request against the registry's first
/// provider, enforcing the deadline, concurrency cap, and reply-schema check
/// described in spec.md §4.2.
pub struct LlmClient {
    registry: ProviderRegistry,
    semaphore: Arc<Semaphore>,
    configured_deadline: Duration,
}

impl LlmClient {
    pub fn new(registry: ProviderRegistry, max_concurrency: usize) -> Self {
        Self::with_deadline(registry, max_concurrency, Duration::from_millis(2000))
    }

    /// `configured_deadline` is `llm.deadline_ms` from `ConfigStore` — a
    /// client-wide ceiling applied on top of whatever deadline an individual
    /// call requests, so lowering it via config takes effect everywhere
    /// without every call site needing to know about it.
    pub fn with_deadline(
        registry: ProviderRegistry,
        max_concurrency: usize,
        configured_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            configured_deadline,
        }
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<Value> {
        let permit = tokio::time::timeout(Duration::from_secs(2), self.semaphore.acquire())
            .await
            .map_err(|_| Error::Unavailable("LLM concurrency limit exceeded".to_string()))?
            .map_err(|_| Error::internal("LLM semaphore closed"))?;

        let provider = self.registry.first().await;
        let deadline = request.deadline.min(self.configured_deadline);
        let schema = request.schema.clone();
        let outcome = tokio::time::timeout(deadline, provider.complete_raw(&request)).await;
        drop(permit);

        let raw = match outcome {
            Err(_) => return Err(Error::Timeout(format!("LLM call exceeded {deadline:?}"))),
            Ok(Err(err)) => {
                let redacted = redact_text(&err.to_string());
                warn!(provider = %provider.info().id, error = %redacted, "LLM call failed");
                return Err(classify_provider_error(&redacted));
            }
            Ok(Ok(raw)) => raw,
        };

        let parsed: Value = serde_json::from_str(&raw).map_err(|err| {
            Error::MalformedResponse(format!("reply was not valid JSON: {err}"))
        })?;
        validate_against_schema(&parsed, &schema)?;
        Ok(parsed)
    }
}

fn classify_provider_error(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("quota") {
        Error::QuotaExceeded(message.to_string())
    } else if lower.contains("authenticate") || lower.contains("api key") || lower.contains("unauthorized") {
        Error::Validation(format!("LLM authentication failed: {message}"))
    } else {
        Error::Unavailable(message.to_string())
    }
}

/// Checks that every key in `schema.required` (a JSON array of strings) is
/// present and non-null on `value` — a structural check, not full JSON
/// Schema.
fn validate_against_schema(value: &Value, schema: &Value) -> Result<()> {
    let Some(required) = schema.get("required").and_then(|v| v.as_array()) else {
        return Ok(());
    };
    for key in required {
        let Some(key) = key.as_str() else { continue };
        match value {
            Value::Array(items) => {
                for item in items {
                    if item.get(key).is_none() {
                        return Err(Error::MalformedResponse(format!(
                            "reply array element missing required field `{key}`"
                        )));
                    }
                }
            }
            Value::Object(_) => {
                if value.get(key).is_none() {
                    return Err(Error::MalformedResponse(format!(
                        "reply missing required field `{key}`"
                    )));
                }
            }
            _ => {
                return Err(Error::MalformedResponse(
                    "reply must be a JSON object or array".to_string(),
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_check_rejects_missing_required_field() {
        let value = serde_json::json!([{"description": "do thing"}]);
        let schema = serde_json::json!({"required": ["description", "estimated_minutes"]});
        assert!(validate_against_schema(&value, &schema).is_err());
    }

    #[test]
    fn schema_check_accepts_complete_array() {
        let value = serde_json::json!([{"description": "do thing", "estimated_minutes": 3}]);
        let schema = serde_json::json!({"required": ["description", "estimated_minutes"]});
        assert!(validate_against_schema(&value, &schema).is_ok());
    }

    #[tokio::test]
    async fn none_provider_is_unavailable() {
        let registry = ProviderRegistry::new(None, None);
        let client = LlmClient::new(registry, 4);
        let request = CompletionRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "split this task".to_string(),
            }],
            schema: serde_json::json!({"required": ["description"]}),
            max_tokens: 256,
            temperature: 0.3,
            deadline: Duration::from_millis(200),
        };
        let err = client.complete(request).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }
}
