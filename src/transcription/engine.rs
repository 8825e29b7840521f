//! # Recognition Engine Boundary
//!
//! The relay talks to speech recognition through two narrow traits:
//! - [`EngineFactory`] builds one engine per session from the recognition config and the
//!   realtime (partial) callback.
//! - [`RecognitionEngine`] is the engine itself: audio goes in through `feed`, final
//!   transcripts come out of the blocking `next_final` call, partial hypotheses come out
//!   through the callback on whatever thread the engine chooses.
//!
//! ## Threading contract:
//! `feed` and `stop` are called from the session's async task while `next_final` blocks
//! on the worker's dedicated thread. Implementations must make that pairing safe.

use crate::config::RecognitionConfig;
use anyhow::Result;
use std::sync::Arc;

/// Realtime partial-result callback, registered when the engine is constructed.
///
/// Engines may invoke it from any thread. It must stay cheap: the relay only pushes
/// the text into the session's event queue.
pub type PartialCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One recognition engine instance, owned by exactly one session.
pub trait RecognitionEngine: Send + Sync {
    /// Push 16-bit little-endian mono PCM. Must not block for the duration of inference.
    fn feed(&self, pcm: &[u8]) -> Result<()>;

    /// Block until the next utterance is finalized.
    ///
    /// ## Returns:
    /// - **Ok(Some(text))**: a finalized utterance (text may be empty)
    /// - **Ok(None)**: the engine was stopped and drained, or shut down
    /// - **Err(e)**: inference failed
    fn next_final(&self) -> Result<Option<String>>;

    /// Finalize the in-progress utterance without releasing resources.
    ///
    /// After the flushed utterance has been returned, `next_final` reports `None`.
    fn stop(&self);

    /// Wake all waiters and stop internal threads.
    ///
    /// Remaining resources are released when the last handle to the engine drops,
    /// which may be later than this call if a blocking call is still in flight.
    fn shutdown(&self);
}

/// Builds recognition engines for new sessions.
pub trait EngineFactory: Send + Sync {
    /// Short backend name for logs and the health endpoint.
    fn name(&self) -> &str;

    /// Construct an engine. Called on a blocking thread; may load model weights.
    fn create(
        &self,
        config: &RecognitionConfig,
        on_partial: PartialCallback,
    ) -> Result<Arc<dyn RecognitionEngine>>;
}
