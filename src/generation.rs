//! Structured-generation capability.
//!
//! A [`StructuredGenerator`] takes a system prompt, a user prompt and a JSON
//! Schema, and returns the raw text of a JSON document the backend produced
//! under that schema. Validation of the returned text happens in the caller
//! (see [`crate::schema::TypeDescriptor::validate_generated`]).
//!
//! Backends:
//! - **[`OllamaGenerator`]**: `POST {url}/api/chat` with `format` set to the
//!   schema, `stream = false`, temperature 0.
//! - **[`OpenAIGenerator`]**: `POST {url}/v1/chat/completions` with a
//!   `json_schema` response format.
//! - **[`DisabledGenerator`]**: for runs whose intent declares no schemas.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::http::{build_client, endpoint, post_json_with_retry};

const OLLAMA_URL: &str = "http://localhost:11434";
const OPENAI_URL: &str = "https://api.openai.com";

#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    /// `false` only for the disabled backend. Checked before a run starts.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Produce raw JSON text constrained by `schema`.
    async fn generate(&self, system: &str, user: &str, schema: &Value) -> Result<String>;
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl StructuredGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn generate(&self, _system: &str, _user: &str, _schema: &Value) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: config.model_name(),
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl StructuredGenerator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, user: &str, schema: &Value) -> Result<String> {
        let body = ollama_request(&self.model, system, user, schema);
        let json = post_json_with_retry(
            &self.client,
            &endpoint(&self.url, "/api/chat"),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_chat(&json)
    }
}

fn ollama_request(model: &str, system: &str, user: &str, schema: &Value) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ],
        "format": schema,
        "stream": false,
        "options": {"temperature": 0},
    })
}

fn parse_ollama_chat(json: &Value) -> Result<String> {
    match json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
        _ => bail!("Ollama returned no content"),
    }
}

// ============ OpenAI ============

/// Reads the key from `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model_name(),
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl StructuredGenerator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system: &str, user: &str, schema: &Value) -> Result<String> {
        let body = openai_request(&self.model, system, user, schema);
        let json = post_json_with_retry(
            &self.client,
            &endpoint(&self.url, "/v1/chat/completions"),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_chat(&json)
    }
}

fn openai_request(model: &str, system: &str, user: &str, schema: &Value) -> Value {
    let name = schema
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("StructuredOutput");
    json!({
        "model": model,
        "temperature": 0,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {"name": name, "schema": schema},
        },
    })
}

fn parse_openai_chat(json: &Value) -> Result<String> {
    match json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
        _ => bail!("OpenAI returned no content"),
    }
}

/// Create the [`StructuredGenerator`] named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn StructuredGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_request_shape() {
        let schema = json!({"title": "ClusterSummary", "type": "object"});
        let body = ollama_request("phi4", "sys", "usr", &schema);
        assert_eq!(body["format"], schema);
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
    }

    #[test]
    fn test_openai_request_names_schema() {
        let schema = json!({"title": "ProjectSummary", "type": "object"});
        let body = openai_request("gpt", "sys", "usr", &schema);
        assert_eq!(body["response_format"]["json_schema"]["name"], "ProjectSummary");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
    }

    #[test]
    fn test_parse_chat_content() {
        let ok = json!({"message": {"role": "assistant", "content": "{\"a\": 1}"}});
        assert_eq!(parse_ollama_chat(&ok).unwrap(), "{\"a\": 1}");
        let empty = json!({"message": {"content": "  "}});
        assert!(parse_ollama_chat(&empty).is_err());
        assert!(parse_ollama_chat(&json!({})).is_err());

        let ok = json!({"choices": [{"message": {"content": "{}"}}]});
        assert_eq!(parse_openai_chat(&ok).unwrap(), "{}");
        assert!(parse_openai_chat(&json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_generator() {
        let generator = DisabledGenerator;
        assert!(!generator.is_enabled());
        assert!(generator.generate("s", "u", &json!({})).await.is_err());
    }
}
