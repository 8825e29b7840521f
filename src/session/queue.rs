//! # Event Queue
//!
//! Unbounded FIFO between the recognition side (worker thread, engine callback threads)
//! and the session's delivery loop.
//!
//! ## Semantics:
//! - `push` never blocks and may be called from any thread
//! - `pop` suspends until an event is available, or returns `None` once the queue is
//!   closed and drained
//! - The queue closes explicitly via `close`, or implicitly once every sender has dropped

use crate::session::protocol::TranscriptionSegment;
use tokio::sync::mpsc;

/// Item carried by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Segment(TranscriptionSegment),
    /// Recognition failed; the delivery loop reports it and stops
    Failure(String),
}

/// Producer handle. Cloned into the worker thread and the partial callback.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// Enqueue an event. Returns false when the consumer has gone away.
    pub fn push(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn push_segment(&self, segment: TranscriptionSegment) -> bool {
        self.push(SessionEvent::Segment(segment))
    }
}

/// Consumer handle, owned by the delivery loop.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventReceiver {
    pub async fn pop(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Refuse further pushes; already queued events can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}
