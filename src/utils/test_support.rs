//! Hand-rolled transport and provider doubles shared by the core tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::provider::{ChunkStream, GenerationError, ModelProvider};
use crate::transport::{
    ChatTransport, IndicatorEvent, MessageEvent, StopSignal, TransportError,
};

/// Give spawned tasks a chance to run on the current-thread test runtime.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[derive(Clone, Debug)]
pub enum TransportCall {
    Event(IndicatorEvent),
    CreateMessage {
        channel_id: String,
        message_id: String,
        text: String,
    },
    UpdateMessage {
        message_id: String,
        text: String,
    },
    Disconnect,
}

/// Transport double that records every call and exposes the subscription
/// senders so tests can inject inbound traffic.
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    next_message_id: AtomicU64,
    inbound_senders: Mutex<Vec<mpsc::UnboundedSender<MessageEvent>>>,
    stop_tx: broadcast::Sender<StopSignal>,
    reject_events: AtomicBool,
    reject_updates: AtomicBool,
    reject_creates: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            calls: Mutex::new(Vec::new()),
            next_message_id: AtomicU64::new(0),
            inbound_senders: Mutex::new(Vec::new()),
            stop_tx: broadcast::channel(16).0,
            reject_events: AtomicBool::new(false),
            reject_updates: AtomicBool::new(false),
            reject_creates: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<IndicatorEvent> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn updates_for(&self, message_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::UpdateMessage {
                    message_id: id,
                    text,
                } if id == message_id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn disconnected(&self) -> bool {
        self.calls()
            .iter()
            .any(|call| matches!(call, TransportCall::Disconnect))
    }

    pub fn send_stop(&self, message_id: &str) {
        let _ = self.stop_tx.send(StopSignal {
            message_id: message_id.to_string(),
        });
    }

    /// Sender feeding the most recent inbound-message subscription.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<MessageEvent> {
        self.inbound_senders
            .lock()
            .unwrap()
            .last()
            .expect("no inbound subscription yet")
            .clone()
    }

    pub fn fail_events(&self, fail: bool) {
        self.reject_events.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.reject_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.reject_creates.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_event(&self, event: IndicatorEvent) -> Result<(), TransportError> {
        if self.reject_events.load(Ordering::SeqCst) {
            return Err(TransportError::Request("event rejected".to_string()));
        }
        self.record(TransportCall::Event(event));
        Ok(())
    }

    async fn create_message(
        &self,
        channel_id: &str,
        text: &str,
    ) -> Result<String, TransportError> {
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(TransportError::Request("create rejected".to_string()));
        }
        let id = format!("m{}", self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(TransportCall::CreateMessage {
            channel_id: channel_id.to_string(),
            message_id: id.clone(),
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn update_message(&self, message_id: &str, text: &str) -> Result<(), TransportError> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(TransportError::Request("update rejected".to_string()));
        }
        self.record(TransportCall::UpdateMessage {
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        Ok(())
    }

    fn subscribe_messages(&self, _channel_id: &str) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound_senders.lock().unwrap().push(tx);
        rx
    }

    fn subscribe_stop_signals(&self) -> broadcast::Receiver<StopSignal> {
        self.stop_tx.subscribe()
    }
}

/// One scripted response per `stream_reply` call, popped in order.
pub enum ProviderScript {
    /// Yield the chunks immediately, then end the stream.
    Chunks(Vec<&'static str>),
    /// Yield the chunks, then stay pending until the token fires.
    ChunksThenPend(Vec<&'static str>),
    /// Yield the chunks, then fail mid-stream.
    ChunksThenError(Vec<&'static str>, String),
    /// Fail the request before any chunk is produced.
    RequestError(String),
    /// Stream driven by the test through the receiver's sender.
    Manual(mpsc::UnboundedReceiver<Result<String, GenerationError>>),
}

pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<ProviderScript>>,
    // keeps ChunksThenPend streams open
    open_senders: Mutex<Vec<mpsc::UnboundedSender<Result<String, GenerationError>>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<ProviderScript>) -> Self {
        ScriptedProvider {
            scripts: Mutex::new(scripts.into()),
            open_senders: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream_reply(
        &self,
        _prompt: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script queued for provider call");

        match script {
            ProviderScript::RequestError(message) => Err(GenerationError::Provider(message)),
            ProviderScript::Chunks(chunks) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for chunk in chunks {
                    let _ = tx.send(Ok(chunk.to_string()));
                }
                Ok(cancellable_stream(cancel, rx))
            }
            ProviderScript::ChunksThenPend(chunks) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for chunk in chunks {
                    let _ = tx.send(Ok(chunk.to_string()));
                }
                self.open_senders.lock().unwrap().push(tx);
                Ok(cancellable_stream(cancel, rx))
            }
            ProviderScript::ChunksThenError(chunks, message) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for chunk in chunks {
                    let _ = tx.send(Ok(chunk.to_string()));
                }
                let _ = tx.send(Err(GenerationError::Provider(message)));
                Ok(cancellable_stream(cancel, rx))
            }
            ProviderScript::Manual(rx) => Ok(cancellable_stream(cancel, rx)),
        }
    }
}

/// Forward items until the source ends, surfacing `Cancelled` when the token
/// fires mid-stream, mirroring the real provider contract.
fn cancellable_stream(
    cancel: CancellationToken,
    mut source: mpsc::UnboundedReceiver<Result<String, GenerationError>>,
) -> ChunkStream {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(GenerationError::Cancelled));
                    return;
                }
                item = source.recv() => item,
            };
            match item {
                Some(item) => {
                    if tx.send(item).is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    });
    Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}
