//! Messaging collaborator seam
//!
//! The WhatsApp wire protocol lives outside this crate. `MessagingClient` is the
//! contract the supervisor drives; `SidecarBridge` implements it by running a
//! bridge process that speaks newline-delimited JSON on stdin/stdout.

use crate::error::{Error, Result};
use crate::session::SessionEvent;
use crate::supervisor::Command;
use crate::triage::InboundMessage;
use async_trait::async_trait;
use qrcode::{Color, QrCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something the messaging session reported
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Lifecycle(SessionEvent),
    Message(InboundMessage),
}

/// Handed to a client on `initialize`; routes its events to the supervisor
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Command>,
    epoch: u64,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<Command>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    /// Session generation this sink reports for
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(Command::Client {
                epoch: self.epoch,
                event,
            })
            .await
            .map_err(|_| Error::SupervisorGone)
    }

    pub async fn lifecycle(&self, event: SessionEvent) -> Result<()> {
        self.send(ClientEvent::Lifecycle(event)).await
    }

    pub async fn message(&self, message: InboundMessage) -> Result<()> {
        self.send(ClientEvent::Message(message)).await
    }
}

/// Contract for the external messaging client
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Begin establishing a session. Returning an error is an init failure.
    async fn initialize(&self, events: EventSink) -> Result<()>;

    /// Tear down the current session
    async fn destroy(&self) -> Result<()>;

    /// Send `text` to the chat `chat_id`
    async fn send_reply(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Shows a pairing token to the operator
pub trait QrRenderer: Send + Sync {
    fn render(&self, token: &str);
}

/// Logs a scannable terminal QR code with instructions
#[derive(Debug, Default, Clone, Copy)]
pub struct LogQrRenderer;

impl QrRenderer for LogQrRenderer {
    fn render(&self, token: &str) {
        info!("{}", "=".repeat(50));
        info!("SCAN THIS QR CODE WITH WHATSAPP:");
        info!("1. Open WhatsApp on your phone");
        info!("2. Menu -> Linked devices -> Link a device");
        info!("3. Point the camera at the code below");
        match render_qr_text(token) {
            Some(qr) => info!("\n{}", qr),
            None => warn!("Could not draw QR code, raw token: {}", token),
        }
        info!("{}", "=".repeat(50));
    }
}

/// Draw `data` as a QR code in Unicode half blocks, two module rows per line,
/// with the 4-module quiet zone scanners need
pub fn render_qr_text(data: &str) -> Option<String> {
    let code = QrCode::new(data.as_bytes()).ok()?;
    let matrix = code.to_colors();
    let width = code.width();
    let quiet = 4;
    let total = width + quiet * 2;

    let color_at = |x: usize, y: usize| {
        if x < quiet || x >= quiet + width || y < quiet || y >= quiet + width {
            Color::Light
        } else {
            matrix[(y - quiet) * width + (x - quiet)]
        }
    };

    let mut out = String::new();
    for y in (0..total).step_by(2) {
        for x in 0..total {
            let top = color_at(x, y);
            let bottom = if y + 1 < total {
                color_at(x, y + 1)
            } else {
                Color::Light
            };
            out.push(match (top, bottom) {
                (Color::Light, Color::Light) => ' ',
                (Color::Dark, Color::Dark) => '\u{2588}',
                (Color::Dark, Color::Light) => '\u{2580}',
                (Color::Light, Color::Dark) => '\u{2584}',
            });
        }
        out.push('\n');
    }
    Some(out)
}

/// Line protocol: events read from the bridge's stdout
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        code: String,
    },
    Authenticated,
    Ready,
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Message {
        from: String,
        #[serde(default)]
        body: String,
        #[serde(default, rename = "fromMe")]
        from_me: bool,
    },
}

impl From<BridgeEvent> for ClientEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { code } => ClientEvent::Lifecycle(SessionEvent::QrIssued(code)),
            BridgeEvent::Authenticated => ClientEvent::Lifecycle(SessionEvent::Authenticated),
            BridgeEvent::Ready => ClientEvent::Lifecycle(SessionEvent::Connected),
            BridgeEvent::Disconnected { reason } => {
                ClientEvent::Lifecycle(SessionEvent::Disconnected(reason))
            }
            BridgeEvent::AuthFailure { message } => {
                ClientEvent::Lifecycle(SessionEvent::AuthFailure(message))
            }
            BridgeEvent::Message {
                from,
                body,
                from_me,
            } => ClientEvent::Message(InboundMessage::new(&from, &body, from_me)),
        }
    }
}

/// Line protocol: commands written to the bridge's stdin
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BridgeCommand<'a> {
    Reply { to: &'a str, text: &'a str },
}

/// Parse one stdout line; blank lines and garbage yield `None`
pub fn parse_bridge_line(line: &str) -> Option<BridgeEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring bridge output {:?}: {}", line, e);
            None
        }
    }
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct BridgeSlot {
    /// Newest session generation that asked for a launch
    epoch: Option<u64>,
    process: Option<BridgeProcess>,
}

/// Runs the messaging bridge as a child process
pub struct SidecarBridge {
    command: String,
    session_dir: PathBuf,
    slot: Mutex<BridgeSlot>,
}

impl std::fmt::Debug for SidecarBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarBridge")
            .field("command", &self.command)
            .field("session_dir", &self.session_dir)
            .finish()
    }
}

impl SidecarBridge {
    pub fn new(command: &str, session_dir: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            session_dir,
            slot: Mutex::new(BridgeSlot::default()),
        }
    }
}

#[async_trait]
impl MessagingClient for SidecarBridge {
    async fn initialize(&self, events: EventSink) -> Result<()> {
        let mut slot = self.slot.lock().await;
        // Launches are spawned concurrently; an older one may arrive late
        if slot.epoch.is_some_and(|newest| newest > events.epoch()) {
            debug!("Skipping launch for superseded session {}", events.epoch());
            return Ok(());
        }
        slot.epoch = Some(events.epoch());

        // A bridge that exited on its own is still parked here
        if let Some(mut stale) = slot.process.take() {
            debug!("Replacing previous bridge process");
            stale.reader.abort();
            let _ = stale.child.start_kill();
            let _ = stale.child.wait().await;
        }

        info!("Launching messaging bridge: {}", self.command);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("WHATSAPP_SESSION_DIR", &self.session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Bridge(format!("failed to start '{}': {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Bridge("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Bridge("bridge stdout unavailable".to_string()))?;

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = parse_bridge_line(&line) else {
                            continue;
                        };
                        if events.send(event.into()).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Bridge stdout read failed: {}", e);
                        break;
                    }
                }
            }
            // Output closed without a destroy: the session is gone
            let _ = events
                .lifecycle(SessionEvent::Disconnected("bridge exited".to_string()))
                .await;
        });

        slot.process = Some(BridgeProcess {
            child,
            stdin,
            reader,
        });
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let Some(mut process) = self.slot.lock().await.process.take() else {
            return Ok(());
        };

        process.reader.abort();
        if let Err(e) = process.child.start_kill() {
            debug!("Bridge already gone: {}", e);
        }
        let status = process.child.wait().await?;
        info!("Messaging bridge stopped ({})", status);
        Ok(())
    }

    async fn send_reply(&self, chat_id: &str, text: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let process = slot
            .process
            .as_mut()
            .ok_or_else(|| Error::Session("no live session".to_string()))?;

        let mut line = serde_json::to_string(&BridgeCommand::Reply { to: chat_id, text })?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lifecycle_lines() {
        assert_eq!(
            parse_bridge_line(r#"{"event":"qr","code":"2@abc"}"#),
            Some(BridgeEvent::Qr {
                code: "2@abc".to_string()
            })
        );
        assert_eq!(
            parse_bridge_line(r#"{"event":"ready"}"#),
            Some(BridgeEvent::Ready)
        );
        assert_eq!(
            parse_bridge_line(r#"{"event":"disconnected"}"#),
            Some(BridgeEvent::Disconnected {
                reason: String::new()
            })
        );
    }

    #[test]
    fn test_parse_message_line() {
        let line = r#"{"event":"message","from":"1203@g.us","body":"hi @bot","fromMe":false}"#;
        let event = parse_bridge_line(line).unwrap();
        match ClientEvent::from(event) {
            ClientEvent::Message(msg) => {
                assert!(msg.is_group_chat);
                assert!(!msg.is_self_sent);
                assert_eq!(msg.body, "hi @bot");
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert!(parse_bridge_line("").is_none());
        assert!(parse_bridge_line("   ").is_none());
        assert!(parse_bridge_line("puppeteer: launching chrome").is_none());
        assert!(parse_bridge_line(r#"{"event":"unknown"}"#).is_none());
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(
            ClientEvent::from(BridgeEvent::Ready),
            ClientEvent::Lifecycle(SessionEvent::Connected)
        );
        assert_eq!(
            ClientEvent::from(BridgeEvent::AuthFailure {
                message: "bad".to_string()
            }),
            ClientEvent::Lifecycle(SessionEvent::AuthFailure("bad".to_string()))
        );
    }

    #[test]
    fn test_reply_command_shape() {
        let json = serde_json::to_value(BridgeCommand::Reply {
            to: "336@c.us",
            text: "hello",
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "reply", "to": "336@c.us", "text": "hello"})
        );
    }

    #[tokio::test]
    async fn test_bridge_forwards_events_and_replies() {
        let temp = tempfile::TempDir::new().unwrap();
        let out = temp.path().join("replies.jsonl");
        let script = format!(
            r#"echo '{{"event":"qr","code":"2@xyz"}}'; echo '{{"event":"ready"}}'; head -n 1 > {}"#,
            out.display()
        );
        let bridge = SidecarBridge::new(&script, temp.path().to_path_buf());

        let (tx, mut rx) = mpsc::channel(8);
        bridge.initialize(EventSink::new(tx, 7)).await.unwrap();

        match rx.recv().await.unwrap() {
            Command::Client { epoch, event } => {
                assert_eq!(epoch, 7);
                assert_eq!(
                    event,
                    ClientEvent::Lifecycle(SessionEvent::QrIssued("2@xyz".to_string()))
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            Command::Client {
                event: ClientEvent::Lifecycle(SessionEvent::Connected),
                ..
            }
        ));

        bridge.send_reply("336@c.us", "hello").await.unwrap();

        // Bridge exits after reading one line, which surfaces as a disconnect
        assert!(matches!(
            rx.recv().await.unwrap(),
            Command::Client {
                event: ClientEvent::Lifecycle(SessionEvent::Disconnected(_)),
                ..
            }
        ));
        let written = std::fs::read_to_string(&out).unwrap();
        assert!(written.contains(r#""action":"reply""#));

        bridge.destroy().await.unwrap();
    }

    #[test]
    fn test_render_qr_text() {
        let qr = render_qr_text("2@Zk3Xb9,QmVyZ2VyLWtleQ==,c2VydmVyLXRva2Vu,1").unwrap();
        let lines: Vec<&str> = qr.lines().collect();
        assert!(lines.len() > 10);
        assert!(lines.iter().all(|l| l.chars().count() == lines[0].chars().count()));
        assert!(qr.contains('\u{2588}'));
    }

    #[tokio::test]
    async fn test_superseded_launch_is_skipped() {
        let temp = tempfile::TempDir::new().unwrap();
        let bridge = SidecarBridge::new(
            r#"echo '{"event":"ready"}'; exec sleep 30"#,
            temp.path().to_path_buf(),
        );

        let (tx, mut rx) = mpsc::channel(8);
        bridge.initialize(EventSink::new(tx.clone(), 3)).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Command::Client { epoch: 3, .. }
        ));

        // Launch requested before the restart, delivered after it
        bridge.initialize(EventSink::new(tx, 2)).await.unwrap();
        {
            let slot = bridge.slot.lock().await;
            assert_eq!(slot.epoch, Some(3));
            assert!(slot.process.is_some());
        }
        assert!(rx.try_recv().is_err());

        bridge.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reply_without_session() {
        let temp = tempfile::TempDir::new().unwrap();
        let bridge = SidecarBridge::new("true", temp.path().to_path_buf());
        assert!(bridge.send_reply("336@c.us", "hi").await.is_err());
        // Destroy with nothing running is fine
        bridge.destroy().await.unwrap();
    }
}
