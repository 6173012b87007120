//! Message triage and dispatch
//!
//! Decides whether an inbound message deserves a reply and delivers it.

use crate::client::MessagingClient;
use crate::config::{GROUP_CHAT_SUFFIX, MENTION_MARKERS};
use crate::responder::Responder;
use tracing::{error, info, warn};

/// Sent when the responder fails or the reply cannot be delivered
pub const APOLOGY_TEXT: &str = "Sorry, something went wrong. Our team has been notified.";

/// A message received on the messaging session
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender_id: String,
    pub body: String,
    pub is_group_chat: bool,
    pub is_self_sent: bool,
}

impl InboundMessage {
    /// Build from a chat id; group chats are recognised by their id suffix
    pub fn new(sender_id: &str, body: &str, is_self_sent: bool) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            is_group_chat: sender_id.ends_with(GROUP_CHAT_SUFFIX),
            is_self_sent,
        }
    }
}

/// Outcome of triage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Sent by this account; ignored entirely
    SelfSent,
    /// Group message without a mention
    NotMentioned,
    /// Eligible but nothing to answer
    EmptyBody,
    Reply,
}

/// Reply policy for direct and group chats
#[derive(Debug, Clone)]
pub struct TriagePolicy {
    markers: Vec<String>,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self::new(MENTION_MARKERS.iter().map(|m| m.to_string()).collect())
    }
}

impl TriagePolicy {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    /// True if the body contains any marker, ignoring case
    pub fn mentions(&self, body: &str) -> bool {
        let body = body.to_lowercase();
        self.markers.iter().any(|m| body.contains(m.as_str()))
    }

    pub fn evaluate(&self, message: &InboundMessage) -> Verdict {
        if message.is_self_sent {
            return Verdict::SelfSent;
        }
        if message.is_group_chat && !self.mentions(&message.body) {
            return Verdict::NotMentioned;
        }
        if message.body.trim().is_empty() {
            return Verdict::EmptyBody;
        }
        Verdict::Reply
    }
}

/// How a reply attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Replied,
    Apologized,
    Failed,
}

/// Generate and send the reply for an eligible message. Never fails.
pub async fn dispatch(
    responder: &dyn Responder,
    client: &dyn MessagingClient,
    message: &InboundMessage,
) -> Delivery {
    let reply = match responder.respond(&message.body, &message.sender_id).await {
        Ok(text) => text,
        Err(e) => {
            error!("Responder failed for {}: {}", message.sender_id, e);
            return send_apology(client, &message.sender_id).await;
        }
    };

    info!(
        "Replying to {}: {}",
        message.sender_id,
        reply.chars().take(100).collect::<String>()
    );

    match client.send_reply(&message.sender_id, &reply).await {
        Ok(()) => Delivery::Replied,
        Err(e) => {
            error!("Failed to send reply to {}: {}", message.sender_id, e);
            send_apology(client, &message.sender_id).await
        }
    }
}

async fn send_apology(client: &dyn MessagingClient, chat_id: &str) -> Delivery {
    match client.send_reply(chat_id, APOLOGY_TEXT).await {
        Ok(()) => Delivery::Apologized,
        Err(e) => {
            warn!("Could not deliver apology to {}: {}", chat_id, e);
            Delivery::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventSink;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedResponder(Result<String>);

    #[async_trait]
    impl Responder for FixedResponder {
        async fn respond(&self, _message: &str, _sender: &str) -> Result<String> {
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(Error::Provider(e.to_string())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        sent: Mutex<Vec<(String, String)>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MessagingClient for RecordingClient {
        async fn initialize(&self, _events: EventSink) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self) -> Result<()> {
            Ok(())
        }

        async fn send_reply(&self, chat_id: &str, text: &str) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Session("socket closed".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_group_detection() {
        assert!(InboundMessage::new("120363025@g.us", "hi", false).is_group_chat);
        assert!(!InboundMessage::new("33612345678@c.us", "hi", false).is_group_chat);
    }

    #[test]
    fn test_self_sent_ignored() {
        let policy = TriagePolicy::default();
        let msg = InboundMessage::new("33612345678@c.us", "hello", true);
        assert_eq!(policy.evaluate(&msg), Verdict::SelfSent);
    }

    #[test]
    fn test_direct_always_eligible() {
        let policy = TriagePolicy::default();
        let msg = InboundMessage::new("33612345678@c.us", "hello team", false);
        assert_eq!(policy.evaluate(&msg), Verdict::Reply);
    }

    #[test]
    fn test_group_requires_mention() {
        let policy = TriagePolicy::default();
        let plain = InboundMessage::new("1203@g.us", "hello team", false);
        assert_eq!(policy.evaluate(&plain), Verdict::NotMentioned);

        let mentioned = InboundMessage::new("1203@g.us", "hello @bot", false);
        assert_eq!(policy.evaluate(&mentioned), Verdict::Reply);

        let keyword = InboundMessage::new("1203@g.us", "Ask the ASSISTANT please", false);
        assert_eq!(policy.evaluate(&keyword), Verdict::Reply);

        let shouted = InboundMessage::new("1203@g.us", "HELLO @BOT", false);
        assert_eq!(policy.evaluate(&shouted), Verdict::Reply);
    }

    #[test]
    fn test_empty_body_not_answered() {
        let policy = TriagePolicy::default();
        let msg = InboundMessage::new("33612345678@c.us", "   \n\t", false);
        assert_eq!(policy.evaluate(&msg), Verdict::EmptyBody);

        let msg = InboundMessage::new("33612345678@c.us", "", false);
        assert_eq!(policy.evaluate(&msg), Verdict::EmptyBody);
    }

    #[test]
    fn test_custom_markers_are_case_insensitive() {
        let policy = TriagePolicy::new(vec!["@Helper".to_string()]);
        assert!(policy.mentions("hey @HELPER"));
        assert!(!policy.mentions("hey @bot"));
    }

    #[tokio::test]
    async fn test_dispatch_sends_reply_to_origin() {
        let responder = FixedResponder(Ok("We open at 9am.".to_string()));
        let client = RecordingClient::default();
        let msg = InboundMessage::new("1203@g.us", "@bot when do you open?", false);

        assert_eq!(dispatch(&responder, &client, &msg).await, Delivery::Replied);
        let sent = client.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![("1203@g.us".to_string(), "We open at 9am.".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dispatch_apologizes_on_responder_error() {
        let responder = FixedResponder(Err(Error::Provider("boom".to_string())));
        let client = RecordingClient::default();
        let msg = InboundMessage::new("33612345678@c.us", "hello", false);

        assert_eq!(dispatch(&responder, &client, &msg).await, Delivery::Apologized);
        assert_eq!(client.sent.lock().unwrap()[0].1, APOLOGY_TEXT);
    }

    #[tokio::test]
    async fn test_dispatch_apologizes_when_send_fails() {
        let responder = FixedResponder(Ok("answer".to_string()));
        let client = RecordingClient::default();
        client.failures_left.store(1, Ordering::SeqCst);
        let msg = InboundMessage::new("33612345678@c.us", "hello", false);

        assert_eq!(dispatch(&responder, &client, &msg).await, Delivery::Apologized);
        assert_eq!(client.sent.lock().unwrap()[0].1, APOLOGY_TEXT);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_total_failure() {
        let responder = FixedResponder(Err(Error::Provider("boom".to_string())));
        let client = RecordingClient::default();
        client.failures_left.store(5, Ordering::SeqCst);
        let msg = InboundMessage::new("33612345678@c.us", "hello", false);

        assert_eq!(dispatch(&responder, &client, &msg).await, Delivery::Failed);
        assert!(client.sent.lock().unwrap().is_empty());
    }
}
