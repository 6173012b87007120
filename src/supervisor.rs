//! Session supervisor
//!
//! Owns the `SessionContext` and runs every lifecycle event, inbound message,
//! retry timer and HTTP command through one serial loop, then carries out the
//! effects the state machine asks for.

use crate::client::{ClientEvent, EventSink, LogQrRenderer, MessagingClient, QrRenderer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::process_uptime;
use crate::responder::Responder;
use crate::session::{Effect, RetryTicket, SessionContext, SessionEvent, SessionState};
use crate::status::StatusStore;
use crate::triage::{dispatch, InboundMessage, TriagePolicy, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 256;
const DESTROY_TIMEOUT: Duration = Duration::from_secs(15);

/// Work items processed by the supervisor loop
#[derive(Debug)]
pub enum Command {
    Client { epoch: u64, event: ClientEvent },
    OpenFailed { epoch: u64, error: String },
    RetryDue(RetryTicket),
    EnsureStarted,
    Restart(oneshot::Sender<()>),
}

/// Latest session state, published after every command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub qr_available: bool,
    pub last_activity: DateTime<Utc>,
}

impl SessionSnapshot {
    fn of(ctx: &SessionContext) -> Self {
        Self {
            state: ctx.state(),
            reconnect_attempts: ctx.reconnect_attempts(),
            qr_available: ctx.pending_qr().is_some(),
            last_activity: ctx.last_activity(),
        }
    }
}

/// Cheap handle used by the HTTP surface
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SupervisorHandle {
    /// Start the session if it was never started; does not wait
    pub async fn ensure_started(&self) -> Result<()> {
        self.tx
            .send(Command::EnsureStarted)
            .await
            .map_err(|_| Error::SupervisorGone)
    }

    /// Reset and restart the session. Returns once the reset is persisted,
    /// not when the new session is connected.
    pub async fn restart(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Restart(ack_tx))
            .await
            .map_err(|_| Error::SupervisorGone)?;
        ack_rx.await.map_err(|_| Error::SupervisorGone)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Watch snapshots as they change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

/// Single owner of the session context
pub struct Supervisor {
    ctx: SessionContext,
    store: StatusStore,
    client: Arc<dyn MessagingClient>,
    responder: Arc<dyn Responder>,
    renderer: Arc<dyn QrRenderer>,
    policy: TriagePolicy,
    keepalive_interval: Duration,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        store: StatusStore,
        client: Arc<dyn MessagingClient>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        let ctx = SessionContext::new(config);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot, _) = watch::channel(SessionSnapshot::of(&ctx));

        Self {
            ctx,
            store,
            client,
            responder,
            renderer: Arc::new(LogQrRenderer),
            policy: TriagePolicy::default(),
            keepalive_interval: config.keepalive_interval,
            tx,
            rx,
            snapshot,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn QrRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_policy(mut self, policy: TriagePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.tx.clone(),
            snapshot: self.snapshot.subscribe(),
        }
    }

    /// Run the loop on the current runtime
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        keepalive.tick().await;

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = keepalive.tick() => self.keep_alive(),
            }
            self.snapshot.send_replace(SessionSnapshot::of(&self.ctx));
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Client { epoch, event } => {
                if epoch != self.ctx.epoch() {
                    debug!("Dropping event from superseded session {}: {:?}", epoch, event);
                    return;
                }
                match event {
                    ClientEvent::Lifecycle(event) => self.on_lifecycle(event).await,
                    ClientEvent::Message(message) => self.on_message(message),
                }
            }
            Command::OpenFailed { epoch, error } => {
                if epoch != self.ctx.epoch() || !self.ctx.is_session_live() {
                    debug!("Ignoring stale init failure: {}", error);
                    return;
                }
                self.on_lifecycle(SessionEvent::InitError(error)).await;
            }
            Command::RetryDue(ticket) => {
                let effects = self.ctx.fire_retry(ticket);
                if effects.is_empty() {
                    debug!("Retry for {} superseded, skipping", ticket.expect);
                } else {
                    info!("Retrying session start after {}", ticket.expect);
                }
                self.execute(effects).await;
            }
            Command::EnsureStarted => {
                let effects = self.ctx.ensure_started();
                if !effects.is_empty() {
                    info!("Initializing WhatsApp session");
                }
                self.execute(effects).await;
            }
            Command::Restart(ack) => {
                info!("Restart requested");
                let effects = self.ctx.restart();
                self.execute(effects).await;
                let _ = ack.send(());
            }
        }
    }

    async fn on_lifecycle(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::QrIssued(_) => info!("QR code received"),
            SessionEvent::Authenticated => info!("Authenticated with WhatsApp"),
            SessionEvent::Connected => info!("WhatsApp connected, bot is active"),
            SessionEvent::Disconnected(reason) => warn!("Disconnected from WhatsApp: {}", reason),
            SessionEvent::AuthFailure(reason) => error!("Authentication failed: {}", reason),
            SessionEvent::InitError(reason) => error!("WhatsApp initialization failed: {}", reason),
        }
        let effects = self.ctx.apply(event);
        self.execute(effects).await;
    }

    fn on_message(&mut self, message: InboundMessage) {
        let verdict = self.policy.evaluate(&message);
        self.ctx.touch();
        if verdict == Verdict::SelfSent {
            // Outgoing traffic only counts as activity
            debug!("Outgoing message in {}", message.sender_id);
            self.persist();
            return;
        }

        info!(
            "New message from {}: {}",
            message.sender_id,
            message.body.chars().take(100).collect::<String>()
        );

        match verdict {
            Verdict::Reply => {
                if message.is_group_chat {
                    info!("Mention detected, answering in group {}", message.sender_id);
                }
                let responder = Arc::clone(&self.responder);
                let client = Arc::clone(&self.client);
                tokio::spawn(async move {
                    dispatch(responder.as_ref(), client.as_ref(), &message).await;
                });
            }
            Verdict::NotMentioned => debug!("No mention in group {}, skipping", message.sender_id),
            Verdict::EmptyBody => debug!("Empty message from {}, skipping", message.sender_id),
            Verdict::SelfSent => {}
        }

        self.persist();
    }

    fn keep_alive(&mut self) {
        if self.ctx.is_session_live() && self.ctx.state() == SessionState::Connected {
            self.ctx.touch();
            self.persist();
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Persist => self.persist(),
                Effect::OpenSession { epoch } => self.open_session(epoch),
                Effect::CloseSession => self.close_session().await,
                Effect::StoreQr(token) => {
                    if let Err(e) = self.store.write_qr(&token) {
                        error!("Failed to save QR code: {}", e);
                    }
                }
                Effect::ShowQr(token) => self.renderer.render(&token),
                Effect::MarkQrConnected => {
                    if let Err(e) = self.store.mark_qr_connected() {
                        warn!("Failed to mark QR file connected: {}", e);
                    }
                }
                Effect::DeleteQr => {
                    if let Err(e) = self.store.remove_qr() {
                        warn!("Failed to delete QR file: {}", e);
                    }
                }
                Effect::ScheduleRetry(ticket) => self.schedule_retry(ticket),
                Effect::RetriesExhausted { attempts } => {
                    error!(
                        "Giving up after {} reconnect attempts, restart required",
                        attempts - 1
                    );
                }
            }
        }
    }

    fn persist(&self) {
        let record = self.ctx.status_record(process_uptime());
        if let Err(e) = self.store.write(&record) {
            error!("Failed to update status file: {}", e);
        }
    }

    fn open_session(&self, epoch: u64) {
        let client = Arc::clone(&self.client);
        let sink = EventSink::new(self.tx.clone(), epoch);
        let tx = self.tx.clone();

        tokio::spawn(async move {
            if let Err(e) = client.initialize(sink).await {
                let _ = tx
                    .send(Command::OpenFailed {
                        epoch,
                        error: e.to_string(),
                    })
                    .await;
            }
        });
    }

    async fn close_session(&self) {
        match tokio::time::timeout(DESTROY_TIMEOUT, self.client.destroy()).await {
            Ok(Ok(())) => debug!("Session torn down"),
            Ok(Err(e)) => warn!("Session teardown failed: {}", e),
            Err(_) => warn!("Session teardown timed out after {:?}", DESTROY_TIMEOUT),
        }
    }

    fn schedule_retry(&self, ticket: RetryTicket) {
        match ticket.expect {
            SessionState::Disconnected => info!(
                "Reconnect attempt {} in {:?}",
                self.ctx.reconnect_attempts(),
                ticket.delay
            ),
            _ => info!("Retrying after {} in {:?}", ticket.expect, ticket.delay),
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ticket.delay).await;
            let _ = tx.send(Command::RetryDue(ticket)).await;
        });
    }
}
