//! Gemini `generateContent` client

use crate::error::{Error, Result};
use crate::responder::TextGenerator;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Serialize)]
pub struct GeminiBody {
    pub contents: Vec<Content>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Part {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    pub candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize, Debug)]
pub struct Candidate {
    pub content: Content,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate
    pub fn text(&self) -> Option<String> {
        let candidate = self.candidates.as_ref()?.first()?;
        let text: String = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Text generator backed by the Gemini REST API
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Point the client at another endpoint (proxies, tests)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = GeminiBody {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        let resp = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "gemini returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: GeminiResponse = resp.json().await?;
        parsed
            .text()
            .ok_or_else(|| Error::Provider("gemini returned no candidates".to_string()))
    }
}
