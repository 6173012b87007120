//! Error types for whatsapp-ai-bot

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Supervisor stopped")]
    SupervisorGone,
}

pub type Result<T> = std::result::Result<T, Error>;
