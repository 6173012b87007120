//! WhatsApp AI Bot - webhook service
//!
//! Bridges a WhatsApp session with a generative-AI responder and exposes
//! status, QR, restart and health endpoints over HTTP.

pub mod client;
pub mod config;
pub mod error;
pub mod gemini;
pub mod health;
pub mod http;
pub mod responder;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod triage;

pub use error::{Error, Result};
