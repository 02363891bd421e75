//! Per-channel dispatcher.
//!
//! Listens for inbound user messages on one channel, spawns a
//! [`StreamingReplyHandler`] per reply, and owns the registry of live
//! handlers so teardown can fan disposal out to all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::chat_stream::HttpProvider;
use crate::core::config::{Config, ConfigError};
use crate::core::prompt::{build_prompt, REPLY_INSTRUCTIONS};
use crate::core::reply::StreamingReplyHandler;
use crate::provider::ModelProvider;
use crate::transport::{ChatTransport, IndicatorEvent, IndicatorState, MessageEvent, ReplyHandle};

/// Set of live reply handlers, keyed by message id.
///
/// Mutated by the dispatcher on creation, by a handler's disposal callback on
/// self-removal, and by bulk teardown; a mutex serializes the three.
pub struct HandlerRegistry {
    inner: Mutex<HashMap<String, Arc<StreamingReplyHandler>>>,
}

impl HandlerRegistry {
    fn new() -> Self {
        HandlerRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler. Returns false without replacing anything if the
    /// message already has one.
    pub fn insert(&self, message_id: String, handler: Arc<StreamingReplyHandler>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&message_id) {
            return false;
        }
        inner.insert(message_id, handler);
        true
    }

    /// Remove a handler. Removing an absent handler is a no-op.
    pub fn remove(&self, message_id: &str) -> bool {
        self.inner.lock().unwrap().remove(message_id).is_some()
    }

    /// Take every live handler, leaving the registry empty.
    pub fn drain(&self) -> Vec<Arc<StreamingReplyHandler>> {
        self.inner.lock().unwrap().drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ReplyDispatcher {
    transport: Arc<dyn ChatTransport>,
    provider: Arc<dyn ModelProvider>,
    channel_id: String,
    instructions: String,
    registry: Arc<HandlerRegistry>,
    last_interaction: Mutex<Option<DateTime<Utc>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ReplyDispatcher {
    /// Validate credentials, build the provider client with its fixed
    /// generation parameters, and subscribe to inbound messages.
    ///
    /// A missing credential is fatal and not retried.
    pub fn init(
        channel_id: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
    ) -> Result<Arc<Self>, ConfigError> {
        let config = Config::from_env()?;
        let provider = Arc::new(HttpProvider::new(&config));
        Ok(Self::with_provider(channel_id, transport, provider))
    }

    /// Like [`ReplyDispatcher::init`] but with a caller-supplied provider.
    pub fn with_provider(
        channel_id: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
        provider: Arc<dyn ModelProvider>,
    ) -> Arc<Self> {
        let channel_id = channel_id.into();
        let dispatcher = Arc::new(ReplyDispatcher {
            transport,
            provider,
            channel_id,
            instructions: REPLY_INSTRUCTIONS.to_string(),
            registry: Arc::new(HandlerRegistry::new()),
            last_interaction: Mutex::new(None),
            inbound_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        let events = dispatcher
            .transport
            .subscribe_messages(&dispatcher.channel_id);
        let task = tokio::spawn(Arc::clone(&dispatcher).listen(events));
        *dispatcher.inbound_task.lock().unwrap() = Some(task);
        dispatcher
    }

    /// Wall-clock time of the last accepted user message, for caller-owned
    /// idle policies.
    pub fn last_interaction(&self) -> Option<DateTime<Utc>> {
        *self.last_interaction.lock().unwrap()
    }

    /// Number of replies currently in flight.
    pub fn live_handlers(&self) -> usize {
        self.registry.len()
    }

    /// Unsubscribe from inbound messages, disconnect the transport session,
    /// and dispose every live handler.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inbound_task.lock().unwrap().take() {
            task.abort();
        }
        if let Err(err) = self.transport.disconnect().await {
            warn!(channel_id = %self.channel_id, error = %err, "transport disconnect failed");
        }
        for handler in self.registry.drain() {
            handler.dispose();
        }
        debug!(channel_id = %self.channel_id, "dispatcher disposed");
    }

    async fn listen(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MessageEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_message(event).await;
        }
    }

    async fn handle_message(self: &Arc<Self>, event: MessageEvent) {
        if event.ai_generated {
            debug!(message_id = %event.message_id, "ignoring AI-authored message");
            return;
        }
        let Some(text) = event.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return;
        };

        *self.last_interaction.lock().unwrap() = Some(Utc::now());
        let prompt = build_prompt(&self.instructions, event.context.as_deref(), text);

        let message_id = match self.transport.create_message(&self.channel_id, "").await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    channel_id = %self.channel_id,
                    error = %err,
                    "could not create reply placeholder"
                );
                return;
            }
        };
        let reply = ReplyHandle {
            channel_id: self.channel_id.clone(),
            message_id: message_id.clone(),
            conversation_id: event.conversation_id.clone(),
        };

        let thinking = IndicatorEvent::update(IndicatorState::Thinking, &reply);
        if let Err(err) = self.transport.send_event(thinking).await {
            warn!(
                message_id = %reply.message_id,
                error = %err,
                "could not send thinking indicator"
            );
        }

        let registry = Arc::clone(&self.registry);
        let removal_id = message_id.clone();
        let handler = StreamingReplyHandler::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.transport),
            reply,
            move || {
                registry.remove(&removal_id);
            },
        );
        handler.set_prompt(prompt);

        if !self.registry.insert(message_id.clone(), Arc::clone(&handler)) {
            warn!(message_id = %message_id, "a reply handler already exists for this message");
            return;
        }
        // A stop signal can land between construction and registration; a
        // handler disposed that early must not linger in the registry.
        if handler.is_done() {
            self.registry.remove(&message_id);
            return;
        }
        // Fire and forget; the handler contains its own failures.
        tokio::spawn(handler.run());
    }
}
