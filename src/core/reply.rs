//! Per-reply streaming state machine.
//!
//! A [`StreamingReplyHandler`] owns exactly one in-flight AI reply: it
//! consumes the provider's chunk stream, throttles partial updates to the
//! chat transport, reacts to external stop signals, and tears itself down
//! exactly once whichever way the run ends.
//!
//! Terminal-state discipline: `done` is flipped with a single atomic swap,
//! so of all the actors that can end a handler (the run loop, the
//! stop-signal listener, an external `dispose`), exactly one wins the
//! transition and performs the terminal side effects; the others observe
//! `done` and no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{GenerationError, ModelProvider};
use crate::transport::{ChatTransport, IndicatorEvent, IndicatorState, ReplyHandle, StopSignal};

/// Minimum spacing between non-final partial message updates.
pub const UPDATE_THROTTLE: Duration = Duration::from_millis(1000);

type DisposeCallback = Box<dyn FnOnce() + Send>;

pub struct StreamingReplyHandler {
    provider: Arc<dyn ModelProvider>,
    transport: Arc<dyn ChatTransport>,
    reply: ReplyHandle,
    prompt: OnceLock<String>,
    done: AtomicBool,
    cancel: CancellationToken,
    on_dispose: Mutex<Option<DisposeCallback>>,
}

impl StreamingReplyHandler {
    /// Build a handler bound to one reply message and start its stop-signal
    /// listener. `on_dispose` is invoked exactly once, whichever actor ends
    /// the handler first.
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        transport: Arc<dyn ChatTransport>,
        reply: ReplyHandle,
        on_dispose: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let handler = Arc::new(StreamingReplyHandler {
            provider,
            transport,
            reply,
            prompt: OnceLock::new(),
            done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_dispose: Mutex::new(Some(Box::new(on_dispose))),
        });
        let signals = handler.transport.subscribe_stop_signals();
        tokio::spawn(Arc::clone(&handler).listen_for_stop(signals));
        handler
    }

    /// Store the fully-assembled prompt. Set once, before `run`.
    pub fn set_prompt(&self, prompt: impl Into<String>) {
        if self.prompt.set(prompt.into()).is_err() {
            warn!(message_id = %self.reply.message_id, "prompt already set, ignoring");
        }
    }

    pub fn reply(&self) -> &ReplyHandle {
        &self.reply
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Drive the reply to completion. Spawned by the dispatcher; all
    /// failures are consumed here, nothing propagates to the caller.
    pub async fn run(self: Arc<Self>) {
        if self.is_done() {
            return;
        }

        // Advisory only; generation proceeds even if the indicator fails.
        let generating = IndicatorEvent::update(IndicatorState::Generating, &self.reply);
        if let Err(err) = self.transport.send_event(generating).await {
            warn!(
                message_id = %self.reply.message_id,
                error = %err,
                "could not send generating indicator"
            );
        }

        let prompt = self.prompt.get().cloned().unwrap_or_default();
        match self.consume_stream(&prompt).await {
            Ok(text) => self.complete(&text).await,
            Err(err) if err.is_cancelled() => self.handle_cancelled().await,
            Err(err) => self.fail(&err).await,
        }

        // Backstop: whichever path ran above has already torn down; this is
        // a no-op unless something returned early without terminating.
        self.dispose();
    }

    /// Consume the provider stream, appending chunks and flushing the full
    /// accumulation at most once per throttle interval. Returns the complete
    /// accumulation on normal exhaustion.
    async fn consume_stream(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut stream = self
            .provider
            .stream_reply(prompt, self.cancel.clone())
            .await?;

        let mut accumulated = String::new();
        let mut last_flush: Option<Instant> = None;

        while let Some(item) = stream.next().await {
            // A stop signal was accepted mid-stream; do not process further
            // chunks even if the provider keeps producing.
            if self.is_done() {
                break;
            }
            let chunk = item?;
            if chunk.is_empty() {
                continue;
            }
            accumulated.push_str(&chunk);

            let now = Instant::now();
            let due = last_flush
                .map_or(true, |at| now.duration_since(at) >= UPDATE_THROTTLE);
            if due {
                self.transport
                    .update_message(&self.reply.message_id, &accumulated)
                    .await
                    .map_err(GenerationError::from)?;
                last_flush = Some(now);
            }
        }

        Ok(accumulated)
    }

    /// Normal exhaustion: one unconditional final flush, clear the
    /// indicator, tear down.
    async fn complete(&self, text: &str) {
        if !self.try_terminate() {
            return;
        }
        match self
            .transport
            .update_message(&self.reply.message_id, text)
            .await
        {
            Ok(()) => self.send_clear().await,
            Err(err) => {
                warn!(
                    message_id = %self.reply.message_id,
                    error = %err,
                    "final update failed"
                );
                self.surface_failure(&GenerationError::from(err)).await;
            }
        }
        self.finish_disposal();
    }

    /// Generation failure: surface the error to the channel, tear down.
    async fn fail(&self, err: &GenerationError) {
        if !self.try_terminate() {
            return;
        }
        warn!(
            message_id = %self.reply.message_id,
            error = %err,
            "reply generation failed"
        );
        self.surface_failure(err).await;
        self.finish_disposal();
    }

    /// Cancellation is not a failure: clear the indicator and leave the
    /// message at its last flushed text.
    async fn handle_cancelled(&self) {
        if !self.try_terminate() {
            return;
        }
        debug!(message_id = %self.reply.message_id, "reply generation cancelled");
        self.send_clear().await;
        self.finish_disposal();
    }

    /// Idempotent teardown with no channel side effects: flip `done`, stop
    /// the provider stream and the stop-signal listener, notify the owner.
    pub fn dispose(&self) {
        if !self.try_terminate() {
            return;
        }
        self.finish_disposal();
    }

    async fn listen_for_stop(self: Arc<Self>, mut signals: broadcast::Receiver<StopSignal>) {
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => return,
                signal = signals.recv() => signal,
            };
            match signal {
                Ok(signal) if signal.message_id == self.reply.message_id => {
                    self.handle_stop().await;
                    return;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        message_id = %self.reply.message_id,
                        skipped,
                        "stop-signal listener lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// External stop request for this handler's message.
    async fn handle_stop(&self) {
        // Request the provider stop regardless of who ends up tearing down.
        self.cancel.cancel();
        if !self.try_terminate() {
            return;
        }
        debug!(message_id = %self.reply.message_id, "stop signal accepted");
        self.send_clear().await;
        self.finish_disposal();
    }

    /// RUNNING -> TERMINATED. Only one caller ever wins.
    fn try_terminate(&self) -> bool {
        !self.done.swap(true, Ordering::SeqCst)
    }

    fn finish_disposal(&self) {
        self.cancel.cancel();
        let callback = self.on_dispose.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
        debug!(message_id = %self.reply.message_id, "reply handler disposed");
    }

    async fn send_clear(&self) {
        let clear = IndicatorEvent::clear(&self.reply);
        if let Err(err) = self.transport.send_event(clear).await {
            warn!(
                message_id = %self.reply.message_id,
                error = %err,
                "could not clear indicator"
            );
        }
    }

    async fn surface_failure(&self, err: &GenerationError) {
        let indicator = IndicatorEvent::update(IndicatorState::Error, &self.reply);
        if let Err(send_err) = self.transport.send_event(indicator).await {
            warn!(
                message_id = %self.reply.message_id,
                error = %send_err,
                "could not send error indicator"
            );
        }
        if let Err(update_err) = self
            .transport
            .update_message(&self.reply.message_id, &err.to_string())
            .await
        {
            warn!(
                message_id = %self.reply.message_id,
                error = %update_err,
                "could not write error text"
            );
        }
    }
}
