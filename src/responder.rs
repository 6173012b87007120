//! AI responder
//!
//! Turns an inbound message into reply text. Without a provider credential it
//! answers from a canned pool; with one it prompts the provider and falls back
//! to a fixed sentence whenever the provider fails.

use crate::config::{
    Config, BUSINESS_HOURS, BUSINESS_NAME, BUSINESS_SERVICES, EMERGENCY_PHONE, SUPPORT_EMAIL,
};
use crate::error::Result;
use crate::gemini::GeminiClient;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::{error, warn};

/// External text-completion provider
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Anything that can produce a reply for an inbound message
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, message: &str, sender: &str) -> Result<String>;
}

/// Returned when the provider call fails
pub static PROVIDER_FALLBACK: Lazy<String> = Lazy::new(|| {
    format!(
        "Thanks for your message. Our team will get back to you shortly. For an immediate answer, contact {}",
        SUPPORT_EMAIL
    )
});

/// Replies used when no provider credential is configured
pub static CANNED_RESPONSES: Lazy<Vec<String>> = Lazy::new(|| {
    vec![
        "Hello! I'm your virtual assistant. Our team will get back to you as soon as possible."
            .to_string(),
        "Thanks for your message. An advisor will contact you shortly.".to_string(),
        format!("We have received your request. Our hours are {}.", BUSINESS_HOURS),
        format!("For immediate assistance, please email {}", SUPPORT_EMAIL),
        "Noted. Our technical team will answer your request soon.".to_string(),
    ]
});

/// Responder with a canned fallback mode
pub struct AiResponder {
    generator: Option<Arc<dyn TextGenerator>>,
}

impl std::fmt::Debug for AiResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiResponder")
            .field("provider", &self.generator.is_some())
            .finish()
    }
}

impl AiResponder {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self { generator }
    }

    /// Build from config: Gemini when a key is present, canned mode otherwise
    pub fn from_config(config: &Config) -> Self {
        match &config.gemini_api_key {
            Some(key) => {
                let client = GeminiClient::new(key, &config.gemini_model);
                Self::new(Some(Arc::new(client)))
            }
            None => {
                warn!("No Gemini API key found, answering from the canned pool");
                Self::new(None)
            }
        }
    }

    pub fn has_provider(&self) -> bool {
        self.generator.is_some()
    }

    /// Produce reply text; never fails
    pub async fn generate_response(&self, message: &str, sender: &str) -> String {
        let Some(generator) = &self.generator else {
            return canned_response();
        };

        match generator.generate(&build_prompt(message)).await {
            Ok(text) => text,
            Err(e) => {
                error!("AI generation failed for {}: {}", sender, e);
                PROVIDER_FALLBACK.clone()
            }
        }
    }
}

#[async_trait]
impl Responder for AiResponder {
    async fn respond(&self, message: &str, sender: &str) -> Result<String> {
        Ok(self.generate_response(message, sender).await)
    }
}

/// Pick one canned reply uniformly at random
pub fn canned_response() -> String {
    CANNED_RESPONSES
        .choose(&mut rand::rng())
        .cloned()
        .unwrap_or_else(|| PROVIDER_FALLBACK.clone())
}

/// Fixed prompt template around the customer message
pub fn build_prompt(message: &str) -> String {
    format!(
        r#"You are a professional customer assistant for a company.

CONTEXT:
- Company: {}
- Services: {}
- Support: {}
- Hours: {}

TASK: Answer the customer message in a helpful, concise and professional way.
TONE: Friendly but professional.

Customer message: "{}"

RULES:
1. Be concise (3 lines max)
2. If you don't know, suggest contacting {}
3. Do not invent information
4. For emergencies, give the number: {}

Answer:"#,
        BUSINESS_NAME,
        BUSINESS_SERVICES,
        SUPPORT_EMAIL,
        BUSINESS_HOURS,
        message,
        SUPPORT_EMAIL,
        EMERGENCY_PHONE
    )
}
