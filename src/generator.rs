use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::offer::RetrievedOffer;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed generation response: {0}")]
    Decode(String),
}

/// Produces the final answer from a query and the ranked offers backing it.
pub trait AnswerGenerator {
    fn generate(&self, query: &str, context: &[RetrievedOffer]) -> Result<String, GenerateError>;
}

const SYSTEM_PROMPT: &str = "You are a career assistant answering questions about \
international job offers. Ground every answer in the offers provided; say so when \
none of them is relevant.";

/// Builds the user prompt: the retrieved offers as a context block, then the
/// question.
pub fn build_prompt(query: &str, context: &[RetrievedOffer]) -> String {
    let context_str = if context.is_empty() {
        String::new()
    } else {
        let rendered: Vec<String> = context.iter().map(render_offer).collect();
        format!(
            "Using the following offers to answer the question:\n\n{}\n\n",
            rendered.join("\n\n")
        )
    };

    format!("{context_str}Question: {query}")
}

fn render_offer(offer: &RetrievedOffer) -> String {
    let mut header: Vec<&str> = Vec::new();
    for key in ["title", "organization", "city", "country"] {
        if let Some(value) = offer.metadata.get(key) {
            header.push(value.as_str());
        }
    }
    format!("[{}] {}\n{}", offer.id, header.join(", "), offer.text)
}

pub struct GeneratorConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            model: "mistral-7b-instruct".to_string(),
            api_key: None,
            max_tokens: 1000,
            temperature: 0.7,
        }
    }
}

/// Chat-completions client for an OpenAI-compatible endpoint.
pub struct HttpGenerator {
    client: Client,
    endpoint: String,
    config: GeneratorConfig,
}

impl HttpGenerator {
    pub fn new(config: GeneratorConfig, timeout: Duration) -> Result<Self, GenerateError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let auth = format!("Bearer {}", key.trim());
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| GenerateError::Decode(format!("invalid api key: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(HttpGenerator {
            client,
            endpoint,
            config,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl AnswerGenerator for HttpGenerator {
    fn generate(&self, query: &str, context: &[RetrievedOffer]) -> Result<String, GenerateError> {
        let prompt = build_prompt(query, context);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self.client.post(&self.endpoint).json(&request).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(GenerateError::Status { status, body });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| GenerateError::Decode(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerateError::Decode("response carried no choices".to_string()))?;
        Ok(choice.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn hit(id: &str, title: &str, city: &str) -> RetrievedOffer {
        RetrievedOffer {
            id: id.to_string(),
            score: 0.9,
            text: format!("Mission: {title}"),
            metadata: HashMap::from([
                ("title".to_string(), title.to_string()),
                ("city".to_string(), city.to_string()),
            ]),
        }
    }

    #[test]
    fn prompt_without_context_is_just_the_question() {
        let prompt = build_prompt("which offers fit a data engineer?", &[]);
        assert_eq!(prompt, "Question: which offers fit a data engineer?");
    }

    #[test]
    fn prompt_renders_offers_before_the_question() {
        let context = vec![hit("42", "Data Engineer", "Singapore")];
        let prompt = build_prompt("what is available in Asia?", &context);
        assert!(prompt.contains("[42] Data Engineer, Singapore"));
        assert!(prompt.contains("Mission: Data Engineer"));
        assert!(prompt.ends_with("Question: what is available in Asia?"));
    }

    #[test]
    fn chat_response_parses_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"Two offers match."}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "Two offers match.");
    }
}
