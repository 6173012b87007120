//! Health report
//!
//! Process vitals (uptime, memory) merged with the last persisted status
//! record. Building the report never fails: read errors degrade the body.

use crate::config::SERVICE_NAME;
use crate::error::Result;
use crate::status::StatusStore;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// `/proc/self/status` memory lines, values in kB
static VM_RSS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^VmRSS:\s+(\d+)\s+kB").expect("Invalid VmRSS regex"));
static VM_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^VmSize:\s+(\d+)\s+kB").expect("Invalid VmSize regex"));
static VM_DATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^VmData:\s+(\d+)\s+kB").expect("Invalid VmData regex"));

/// Pin the process start time; call once at boot
pub fn mark_process_start() {
    Lazy::force(&PROCESS_START);
}

/// Seconds since `mark_process_start` (or first use)
pub fn process_uptime() -> f64 {
    PROCESS_START.elapsed().as_secs_f64()
}

/// Memory figures rendered as "N MB"
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss: String,
    pub heap_total: String,
    pub heap_used: String,
}

impl MemoryUsage {
    /// Parse a `/proc/<pid>/status` document
    pub fn from_proc_status(content: &str) -> Self {
        Self {
            rss: format_mb(capture_kb(&VM_RSS, content)),
            heap_total: format_mb(capture_kb(&VM_SIZE, content)),
            heap_used: format_mb(capture_kb(&VM_DATA, content)),
        }
    }

    pub fn current() -> Self {
        let content = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
        Self::from_proc_status(&content)
    }
}

fn capture_kb(pattern: &Regex, content: &str) -> Option<u64> {
    pattern
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn format_mb(kb: Option<u64>) -> String {
    match kb {
        Some(kb) => format!("{} MB", (kb as f64 / 1024.0).round() as u64),
        None => "unknown".to_string(),
    }
}

/// Build the `/health` body from the persisted status
pub fn health_report(store: &StatusStore) -> Value {
    match try_health_report(store) {
        Ok(body) => body,
        Err(e) => degraded_report(&e.to_string()),
    }
}

fn try_health_report(store: &StatusStore) -> Result<Value> {
    let whatsapp = store.read_raw()?;
    Ok(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": process_uptime(),
        "memory": MemoryUsage::current(),
        "runtime": {
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
        },
        "whatsapp": whatsapp,
    }))
}

pub fn degraded_report(error: &str) -> Value {
    json!({
        "status": "degraded",
        "error": error,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": process_uptime(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::status::StatusRecord;
    use tempfile::TempDir;

    const PROC_STATUS: &str = "Name:\twhatsapp-ai-bot\n\
        VmPeak:\t  210000 kB\n\
        VmSize:\t  204800 kB\n\
        VmData:\t   51200 kB\n\
        VmRSS:\t   30720 kB\n\
        Threads:\t8\n";

    #[test]
    fn test_memory_from_proc_status() {
        let mem = MemoryUsage::from_proc_status(PROC_STATUS);
        assert_eq!(mem.rss, "30 MB");
        assert_eq!(mem.heap_total, "200 MB");
        assert_eq!(mem.heap_used, "50 MB");
    }

    #[test]
    fn test_memory_missing_fields() {
        let mem = MemoryUsage::from_proc_status("Name:\tfoo\n");
        assert_eq!(mem.rss, "unknown");
    }

    #[test]
    fn test_memory_serializes_camel_case() {
        let json = serde_json::to_value(MemoryUsage::from_proc_status(PROC_STATUS)).unwrap();
        assert!(json.get("heapTotal").is_some());
        assert!(json.get("heapUsed").is_some());
    }

    #[test]
    fn test_uptime_monotonic() {
        mark_process_start();
        let a = process_uptime();
        let b = process_uptime();
        assert!(b >= a);
    }

    #[test]
    fn test_healthy_report_embeds_status() {
        let temp_dir = TempDir::new().unwrap();
        let store = StatusStore::new(&Config::for_test(temp_dir.path()));
        store.write(&StatusRecord::initial()).unwrap();

        let report = health_report(&store);
        assert_eq!(report["status"], "healthy");
        assert_eq!(report["service"], SERVICE_NAME);
        assert_eq!(report["whatsapp"]["status"], "initializing");
        assert!(report["memory"]["rss"].is_string());
        assert!(report["runtime"]["platform"].is_string());
        // No separate runtime: the version is the service build
        assert_eq!(report["runtime"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_missing_status_file_is_healthy() {
        let temp_dir = TempDir::new().unwrap();
        let store = StatusStore::new(&Config::for_test(temp_dir.path()));

        let report = health_report(&store);
        assert_eq!(report["status"], "healthy");
        assert_eq!(report["whatsapp"], json!({}));
    }

    #[test]
    fn test_corrupt_status_file_degrades() {
        let temp_dir = TempDir::new().unwrap();
        let store = StatusStore::new(&Config::for_test(temp_dir.path()));
        std::fs::write(store.status_file(), "{\"status\": ").unwrap();

        let report = health_report(&store);
        assert_eq!(report["status"], "degraded");
        assert!(report["error"].as_str().unwrap().contains("JSON"));
        assert!(report.get("whatsapp").is_none());
    }
}
