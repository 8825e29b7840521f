//! # Delivery Loop
//!
//! Drains a session's event queue onto the WebSocket, one text frame per event, in
//! queue order. The loop is a plain future: the session manager spawns it and cancels it
//! by aborting the task, which drops any in-flight wait or write.

use crate::session::protocol::{ErrorMessage, OutboundMessage, SegmentKind};
use crate::session::queue::{EventReceiver, SessionEvent};
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace};

/// Segments written to the transport so far, readable while the session runs.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    partials: AtomicU64,
    finals: AtomicU64,
}

impl DeliveryStats {
    pub fn partials(&self) -> u64 {
        self.partials.load(Ordering::Relaxed)
    }

    pub fn finals(&self) -> u64 {
        self.finals.load(Ordering::Relaxed)
    }

    fn record(&self, kind: SegmentKind) {
        let counter = match kind {
            SegmentKind::Partial => &self.partials,
            SegmentKind::Final => &self.finals,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEnd {
    /// The queue closed and every event was written
    Drained,
    /// A write failed; the client is gone
    TransportClosed,
    /// The worker reported a recognition failure (already sent to the client)
    Failure(String),
}

/// Run the loop until the queue is drained, a write fails, or a failure event arrives.
///
/// Hands the sink back so the caller can still close the connection.
pub async fn run<K>(
    mut queue: EventReceiver,
    mut sink: K,
    uid: String,
    stats: std::sync::Arc<DeliveryStats>,
) -> (K, DeliveryEnd)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    while let Some(event) = queue.pop().await {
        match event {
            SessionEvent::Segment(segment) => {
                let kind = segment.kind();
                let json = match OutboundMessage::single(&uid, segment).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("[{}] failed to serialize segment: {}", uid, e);
                        continue;
                    }
                };
                trace!("[{}] -> {}", uid, json);

                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!("[{}] transport closed during delivery: {}", uid, e);
                    return (sink, DeliveryEnd::TransportClosed);
                }
                stats.record(kind);
            }
            SessionEvent::Failure(message) => {
                error!("[{}] recognition failed: {}", uid, message);
                if let Ok(json) = ErrorMessage::new(&uid, message.as_str()).to_json() {
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        debug!("[{}] could not report failure: {}", uid, e);
                    }
                }
                return (sink, DeliveryEnd::Failure(message));
            }
        }
    }

    debug!("[{}] event queue drained", uid);
    (sink, DeliveryEnd::Drained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::TranscriptionSegment;
    use crate::session::queue;
    use serde_json::Value;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    fn texts(sent: &[Message]) -> Vec<Value> {
        sent.iter()
            .map(|m| match m {
                Message::Text(t) => serde_json::from_str(t).unwrap(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect()
    }

    /// Sink that records every frame.
    #[derive(Debug, Default)]
    struct RecordingSink(Vec<Message>);

    impl Sink<Message> for RecordingSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), String> {
            self.0.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Sink whose every write fails.
    struct ClosedSink;

    impl Sink<Message> for ClosedSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Err("connection reset".to_string()))
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), String> {
            Err("connection reset".to_string())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_delivers_in_queue_order() {
        let (tx, rx) = queue::channel();
        tx.push_segment(TranscriptionSegment::partial("he"));
        tx.push_segment(TranscriptionSegment::partial("hello"));
        tx.push_segment(TranscriptionSegment::final_text("hello there"));
        drop(tx);

        let stats = Arc::new(DeliveryStats::default());
        let (sent, end) = run(rx, RecordingSink::default(), "s1".into(), stats.clone()).await;
        assert_eq!(end, DeliveryEnd::Drained);

        let values = texts(&sent.0);
        let order: Vec<&str> = values
            .iter()
            .map(|v| v["segments"][0]["text"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["he", "hello", "hello there"]);
        assert_eq!(values[2]["status"], "transforming");
        assert!(values.iter().all(|v| v["uid"] == "s1"));
        assert_eq!((stats.partials(), stats.finals()), (2, 1));
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_ends_loop() {
        let (tx, rx) = queue::channel();
        tx.push(SessionEvent::Failure("decoder error".into()));
        tx.push_segment(TranscriptionSegment::final_text("never sent"));

        let (sent, end) = run(rx, RecordingSink::default(), "s1".into(), Default::default()).await;
        assert_eq!(end, DeliveryEnd::Failure("decoder error".into()));
        let values = texts(&sent.0);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["status"], "error");
    }

    #[tokio::test]
    async fn test_write_failure_stops_quietly() {
        let (tx, rx) = queue::channel();
        tx.push_segment(TranscriptionSegment::partial("lost"));

        let stats = Arc::new(DeliveryStats::default());
        let (_, end) = run(rx, ClosedSink, "s1".into(), stats.clone()).await;
        assert_eq!(end, DeliveryEnd::TransportClosed);
        assert_eq!(stats.partials(), 0);
    }

    #[tokio::test]
    async fn test_abort_cancels_pending_wait() {
        let (_tx, rx) = queue::channel();
        let task = tokio::spawn(run(rx, RecordingSink::default(), "s1".into(), Default::default()));
        tokio::task::yield_now().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
