//! Chat-side collaborator boundary.
//!
//! The transport owns connection management, message persistence, and pub/sub
//! event delivery; this crate only consumes it. Implementations wrap whatever
//! chat backend the host program talks to. Subscriptions hand out tokio
//! receivers; dropping a receiver is unsubscription.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Identifies the AI-authored message one handler streams into.
///
/// Created once per inbound user message and never reused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyHandle {
    pub channel_id: String,
    pub message_id: String,
    pub conversation_id: String,
}

/// State tag carried by an `ai_indicator.update` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndicatorState {
    Thinking,
    Generating,
    Error,
}

/// Out-of-band status broadcast shown to chat participants, distinct from the
/// message content itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IndicatorEvent {
    #[serde(rename = "ai_indicator.update")]
    Update {
        state: IndicatorState,
        channel_id: String,
        message_id: String,
    },
    #[serde(rename = "ai_indicator.clear")]
    Clear {
        channel_id: String,
        message_id: String,
    },
}

impl IndicatorEvent {
    pub fn update(state: IndicatorState, reply: &ReplyHandle) -> Self {
        IndicatorEvent::Update {
            state,
            channel_id: reply.channel_id.clone(),
            message_id: reply.message_id.clone(),
        }
    }

    pub fn clear(reply: &ReplyHandle) -> Self {
        IndicatorEvent::Clear {
            channel_id: reply.channel_id.clone(),
            message_id: reply.message_id.clone(),
        }
    }
}

/// Inbound chat message observed on a channel subscription.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub channel_id: String,
    pub message_id: String,
    pub conversation_id: String,
    /// Message body; absent for non-text events.
    pub text: Option<String>,
    /// Set when the message was authored by the assistant itself.
    pub ai_generated: bool,
    /// Optional per-message task context folded into the prompt.
    pub context: Option<String>,
}

/// External request to stop an in-flight generation for one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopSignal {
    pub message_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("unknown channel or message: {0}")]
    NotFound(String),
    #[error("transport session disconnected")]
    Disconnected,
}

/// Operations the chat backend must provide.
///
/// All methods are driven from handler and dispatcher tasks, so
/// implementations must be `Send + Sync` and internally synchronized.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Broadcast an indicator event to the participants of its channel.
    async fn send_event(&self, event: IndicatorEvent) -> Result<(), TransportError>;

    /// Create a message on a channel and return its id.
    async fn create_message(&self, channel_id: &str, text: &str)
        -> Result<String, TransportError>;

    /// Replace a message's text in place.
    async fn update_message(&self, message_id: &str, text: &str) -> Result<(), TransportError>;

    /// Tear down the transport session.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Subscribe to inbound messages on one channel.
    fn subscribe_messages(&self, channel_id: &str) -> mpsc::UnboundedReceiver<MessageEvent>;

    /// Subscribe to stop-generating signals. Signals are fanned out to every
    /// subscriber; listeners filter by message id.
    fn subscribe_stop_signals(&self) -> broadcast::Receiver<StopSignal>;
}
