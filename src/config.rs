//! Configuration and paths

use std::path::{Path, PathBuf};
use std::time::Duration;

/// All configurable paths and constants
#[derive(Debug, Clone)]
pub struct Config {
    pub tmp_dir: PathBuf,
    pub session_dir: PathBuf,
    pub qr_file: PathBuf,
    pub status_file: PathBuf,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub platform: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub init_retry_delay: Duration,
    pub keepalive_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_tmp_dir(&std::env::temp_dir())
    }
}

impl Config {
    /// Lay out all artifacts under `tmp_dir`, everything else at defaults
    pub fn with_tmp_dir(tmp_dir: &Path) -> Self {
        Self {
            tmp_dir: tmp_dir.to_path_buf(),
            session_dir: tmp_dir.join("whatsapp-sessions"),
            qr_file: tmp_dir.join("whatsapp-qr.txt"),
            status_file: tmp_dir.join("whatsapp-status.json"),
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            platform: DEFAULT_PLATFORM.to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            init_retry_delay: INIT_RETRY_DELAY,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }

    /// Read the optional provider settings from the environment
    pub fn from_env(tmp_dir: &Path) -> Self {
        let mut config = Self::with_tmp_dir(tmp_dir);
        config.gemini_api_key = env_value("GEMINI_API_KEY");
        if let Some(model) = env_value("GEMINI_MODEL") {
            config.gemini_model = model;
        }
        if let Some(platform) = env_value("DEPLOY_PLATFORM") {
            config.platform = platform;
        }
        config
    }

    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self::with_tmp_dir(temp_dir)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub const SERVICE_NAME: &str = "whatsapp-ai-bot";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-pro";
pub const DEFAULT_PLATFORM: &str = "self-hosted";

/// Automatic reconnects allowed before an operator restart is required
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);
pub const INIT_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Written to the QR file once the session is connected
pub const QR_CONNECTED_SENTINEL: &str = "CONNECTED";

/// Chat ids with this suffix are group chats
pub const GROUP_CHAT_SUFFIX: &str = "@g.us";

/// Case-insensitive substrings that make the bot answer in a group
pub const MENTION_MARKERS: &[&str] = &["@bot", "assistant"];

/// Static business context embedded in every provider prompt
pub const BUSINESS_NAME: &str = "SaaS platform";
pub const BUSINESS_SERVICES: &str = "Web development, mobile applications, hosting";
pub const SUPPORT_EMAIL: &str = "support@company.example";
pub const BUSINESS_HOURS: &str = "9am-6pm, Monday to Friday";
pub const EMERGENCY_PHONE: &str = "+33 1 23 45 67 89";
