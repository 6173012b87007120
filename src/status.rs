//! Status store - the persisted mirror of the session lifecycle
//!
//! Holds the status JSON file and the QR payload file. Every write replaces
//! the whole file.

use crate::config::{Config, QR_CONNECTED_SENTINEL};
use crate::error::{Error, Result};
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

/// Snapshot written on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: SessionState,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub qr_available: bool,
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub uptime: f64,
}

impl StatusRecord {
    /// Record written before any session has been attempted
    pub fn initial() -> Self {
        Self {
            status: SessionState::Initializing,
            last_update: Utc::now(),
            last_activity: None,
            connected: false,
            qr_available: false,
            reconnect_attempts: 0,
            uptime: 0.0,
        }
    }
}

/// File-backed store for the status record and QR payload
#[derive(Debug, Clone)]
pub struct StatusStore {
    status_file: PathBuf,
    qr_file: PathBuf,
    session_dir: PathBuf,
}

impl StatusStore {
    pub fn new(config: &Config) -> Self {
        Self {
            status_file: config.status_file.clone(),
            qr_file: config.qr_file.clone(),
            session_dir: config.session_dir.clone(),
        }
    }

    pub fn status_file(&self) -> &Path {
        &self.status_file
    }

    /// Directory the messaging bridge keeps its credentials in
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Create the session directory and seed the status file
    pub fn init(&self) -> Result<()> {
        if !self.session_dir.exists() {
            fs::create_dir_all(&self.session_dir)?;
            info!("Created session directory: {}", self.session_dir.display());
        }

        if !self.status_file.exists() {
            self.write(&StatusRecord::initial())?;
        }

        Ok(())
    }

    /// Replace the status file atomically
    pub fn write(&self, record: &StatusRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&self.status_file, json.as_bytes())
    }

    /// Read the status file as a typed record
    pub fn read(&self) -> Result<Option<StatusRecord>> {
        if !self.status_file.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.status_file)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Read the status file as a raw JSON object, empty when missing
    pub fn read_raw(&self) -> Result<Map<String, Value>> {
        if !self.status_file.exists() {
            return Ok(Map::new());
        }

        let content = fs::read_to_string(&self.status_file)?;
        match serde_json::from_str(&content)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Parse(format!(
                "status file holds {} instead of an object",
                json_kind(&other)
            ))),
        }
    }

    pub fn write_qr(&self, token: &str) -> Result<()> {
        write_atomic(&self.qr_file, token.as_bytes())
    }

    /// Overwrite an existing QR file with the connected sentinel
    pub fn mark_qr_connected(&self) -> Result<()> {
        if self.qr_file.exists() {
            self.write_qr(QR_CONNECTED_SENTINEL)?;
        }
        Ok(())
    }

    /// QR file content, empty when no QR has been stored
    pub fn read_qr(&self) -> Result<String> {
        if !self.qr_file.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(&self.qr_file)?)
    }

    pub fn remove_qr(&self) -> Result<()> {
        match fs::remove_file(&self.qr_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// True when a QR payload is an actual token rather than empty or the sentinel
pub fn is_scannable(qr: &str) -> bool {
    !qr.is_empty() && qr != QR_CONNECTED_SENTINEL
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(temp_dir: &TempDir) -> StatusStore {
        StatusStore::new(&Config::for_test(temp_dir.path()))
    }

    #[test]
    fn test_init_seeds_status_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        store.init().unwrap();

        assert!(store.session_dir().exists());
        let record = store.read().unwrap().unwrap();
        assert_eq!(record.status, SessionState::Initializing);
        assert_eq!(record.reconnect_attempts, 0);
    }

    #[test]
    fn test_init_keeps_existing_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        let mut record = StatusRecord::initial();
        record.status = SessionState::Connected;
        record.connected = true;
        store.write(&record).unwrap();

        store.init().unwrap();
        assert_eq!(store.read().unwrap().unwrap().status, SessionState::Connected);
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        let record = StatusRecord {
            status: SessionState::Disconnected,
            last_update: Utc::now(),
            last_activity: Some(Utc::now()),
            connected: false,
            qr_available: false,
            reconnect_attempts: 3,
            uptime: 12.5,
        };
        store.write(&record).unwrap();

        assert_eq!(store.read().unwrap().unwrap(), record);
    }

    #[test]
    fn test_record_uses_camel_case_keys() {
        let json = serde_json::to_value(StatusRecord::initial()).unwrap();
        assert_eq!(json["status"], "initializing");
        assert!(json.get("lastUpdate").is_some());
        assert!(json.get("reconnectAttempts").is_some());
        assert!(json.get("qrAvailable").is_some());
    }

    #[test]
    fn test_read_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        assert!(store.read().unwrap().is_none());
        assert!(store.read_raw().unwrap().is_empty());
    }

    #[test]
    fn test_read_raw_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        fs::write(store.status_file(), "{ definitely not json").unwrap();

        assert!(store.read_raw().is_err());
    }

    #[test]
    fn test_read_raw_rejects_non_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);
        fs::write(store.status_file(), "[1, 2, 3]").unwrap();

        let err = store.read_raw().unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_qr_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = test_store(&temp_dir);

        // No file yet: the sentinel is not written
        store.mark_qr_connected().unwrap();
        assert_eq!(store.read_qr().unwrap(), "");

        store.write_qr("2@abc,def").unwrap();
        assert_eq!(store.read_qr().unwrap(), "2@abc,def");

        store.mark_qr_connected().unwrap();
        assert_eq!(store.read_qr().unwrap(), QR_CONNECTED_SENTINEL);

        store.remove_qr().unwrap();
        assert_eq!(store.read_qr().unwrap(), "");

        // Removing twice is fine
        store.remove_qr().unwrap();
    }

    #[test]
    fn test_is_scannable() {
        assert!(is_scannable("2@token"));
        assert!(!is_scannable(""));
        assert!(!is_scannable(QR_CONNECTED_SENTINEL));
    }
}
