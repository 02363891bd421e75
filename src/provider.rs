//! Generative-model collaborator boundary.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// Finite, non-restartable sequence of generated text chunks.
///
/// Exhaustion (the stream returning `None`) is normal completion. A
/// [`GenerationError::Cancelled`] item means the cancellation token fired
/// mid-stream; any other error item ends the stream abnormally.
pub type ChunkStream = BoxStream<'static, Result<String, GenerationError>>;

/// Failure of an active generation run.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The run was stopped via its cancellation token. Not a failure.
    #[error("generation cancelled")]
    Cancelled,
    #[error("provider error: {0}")]
    Provider(String),
    /// A chat-transport call failed while the run was active.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl GenerationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }
}

/// A client that can stream one reply for a prompt.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Request a streaming generation. Returns `Err` if the request itself
    /// fails; triggering `cancel` afterwards requests the stream to stop.
    async fn stream_reply(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError>;
}
