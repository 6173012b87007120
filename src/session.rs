//! Connection state machine
//!
//! `SessionContext` owns the lifecycle state of the messaging session. Every
//! operation mutates the context and returns the side effects the caller must
//! carry out; nothing here touches the network, the file system or a timer.

use crate::config::Config;
use crate::status::StatusRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of the messaging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    AwaitingQrScan,
    Authenticated,
    Connected,
    Disconnected,
    AuthFailure,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::AwaitingQrScan => "awaiting_qr_scan",
            SessionState::Authenticated => "authenticated",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::AuthFailure => "auth_failure",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events reported by the messaging collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    QrIssued(String),
    Authenticated,
    Connected,
    Disconnected(String),
    AuthFailure(String),
    InitError(String),
}

impl SessionEvent {
    /// State the machine is in after handling this event
    pub fn target_state(&self) -> SessionState {
        match self {
            SessionEvent::QrIssued(_) => SessionState::AwaitingQrScan,
            SessionEvent::Authenticated => SessionState::Authenticated,
            SessionEvent::Connected => SessionState::Connected,
            SessionEvent::Disconnected(_) => SessionState::Disconnected,
            SessionEvent::AuthFailure(_) => SessionState::AuthFailure,
            SessionEvent::InitError(_) => SessionState::Error,
        }
    }
}

/// A delayed `start()` that only runs if nothing superseded it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTicket {
    pub expect: SessionState,
    pub epoch: u64,
    pub delay: Duration,
}

/// Side effects requested by a transition, in execution order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Rewrite the status record
    Persist,
    /// Begin establishing a session with the messaging collaborator
    OpenSession { epoch: u64 },
    /// Tear down the live session
    CloseSession,
    StoreQr(String),
    ShowQr(String),
    MarkQrConnected,
    DeleteQr,
    ScheduleRetry(RetryTicket),
    /// Reconnect budget spent; only an explicit restart recovers
    RetriesExhausted { attempts: u32 },
}

/// Process-wide session context
#[derive(Debug, Clone)]
pub struct SessionContext {
    state: SessionState,
    reconnect_attempts: u32,
    pending_qr: Option<String>,
    last_activity: DateTime<Utc>,
    session_live: bool,
    epoch: u64,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    init_retry_delay: Duration,
}

impl SessionContext {
    pub fn new(config: &Config) -> Self {
        Self {
            state: SessionState::Initializing,
            reconnect_attempts: 0,
            pending_qr: None,
            last_activity: Utc::now(),
            session_live: false,
            epoch: 0,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            init_retry_delay: config.init_retry_delay,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn pending_qr(&self) -> Option<&str> {
        self.pending_qr.as_deref()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn is_session_live(&self) -> bool {
        self.session_live
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Begin a session unless one already exists
    pub fn start(&mut self) -> Vec<Effect> {
        if self.session_live {
            return Vec::new();
        }

        self.state = SessionState::Initializing;
        self.session_live = true;
        vec![Effect::Persist, Effect::OpenSession { epoch: self.epoch }]
    }

    /// First-request trigger: only starts a session that was never started
    pub fn ensure_started(&mut self) -> Vec<Effect> {
        if self.session_live || self.state != SessionState::Initializing {
            return Vec::new();
        }
        self.start()
    }

    /// Apply a lifecycle event
    pub fn apply(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::QrIssued(token) => {
                self.pending_qr = Some(token.clone());
                self.state = SessionState::AwaitingQrScan;
                vec![
                    Effect::StoreQr(token.clone()),
                    Effect::ShowQr(token),
                    Effect::Persist,
                ]
            }
            SessionEvent::Authenticated => {
                self.state = SessionState::Authenticated;
                self.pending_qr = None;
                vec![Effect::Persist]
            }
            SessionEvent::Connected => {
                self.state = SessionState::Connected;
                self.pending_qr = None;
                self.reconnect_attempts = 0;
                self.last_activity = Utc::now();
                vec![Effect::MarkQrConnected, Effect::Persist]
            }
            SessionEvent::Disconnected(_) => {
                self.state = SessionState::Disconnected;
                self.session_live = false;
                self.pending_qr = None;
                self.reconnect_attempts += 1;

                let mut effects = vec![Effect::Persist];
                if self.reconnect_attempts <= self.max_reconnect_attempts {
                    effects.push(Effect::ScheduleRetry(
                        self.next_ticket(SessionState::Disconnected, self.reconnect_delay),
                    ));
                } else {
                    // Terminal until restart: nothing more from this session counts
                    self.epoch += 1;
                    effects.push(Effect::RetriesExhausted {
                        attempts: self.reconnect_attempts,
                    });
                }
                effects
            }
            SessionEvent::AuthFailure(_) => {
                self.state = SessionState::AuthFailure;
                self.pending_qr = None;
                // The failing session's trailing events (its exit, mostly) are stale now
                self.epoch += 1;
                vec![Effect::Persist]
            }
            SessionEvent::InitError(_) => {
                self.state = SessionState::Error;
                self.session_live = false;
                self.pending_qr = None;
                vec![
                    Effect::Persist,
                    Effect::ScheduleRetry(
                        self.next_ticket(SessionState::Error, self.init_retry_delay),
                    ),
                ]
            }
        }
    }

    /// Fire a scheduled retry; stale tickets do nothing
    pub fn fire_retry(&mut self, ticket: RetryTicket) -> Vec<Effect> {
        if ticket.epoch != self.epoch || ticket.expect != self.state {
            return Vec::new();
        }
        self.start()
    }

    /// Operator restart: tear down, reset, start again
    pub fn restart(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.session_live {
            effects.push(Effect::CloseSession);
        }

        self.session_live = false;
        self.state = SessionState::Initializing;
        self.reconnect_attempts = 0;
        self.pending_qr = None;
        self.epoch += 1;

        effects.push(Effect::DeleteQr);
        effects.extend(self.start());
        effects
    }

    /// Record activity without a state change
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn status_record(&self, uptime: f64) -> StatusRecord {
        StatusRecord {
            status: self.state,
            last_update: Utc::now(),
            last_activity: Some(self.last_activity),
            connected: self.state == SessionState::Connected,
            qr_available: self.pending_qr.is_some(),
            reconnect_attempts: self.reconnect_attempts,
            uptime,
        }
    }

    fn next_ticket(&mut self, expect: SessionState, delay: Duration) -> RetryTicket {
        self.epoch += 1;
        RetryTicket {
            expect,
            epoch: self.epoch,
            delay,
        }
    }
}
