//! # Recognition Worker
//!
//! Owns one recognition engine and the dedicated thread that waits on it.
//!
//! ## Lifecycle:
//! 1. `new` builds the engine (blocking: may load model weights) and registers the
//!    partial callback, which pushes `inprogress` segments into the event queue
//! 2. `start` spawns the worker thread, which loops on the engine's blocking
//!    `next_final` and pushes `transcribed` segments
//! 3. `stop` asks the engine to flush the open utterance (end of stream)
//! 4. `shutdown` raises the shutdown flag and wakes the engine
//! 5. `join` waits for the thread with a bounded timeout; a thread still blocked in the
//!    engine after that is detached and finishes on its own
//!
//! ## Queue closure:
//! The worker thread and the partial callback are the queue's only producers. When the
//! thread exits it disconnects the callback and drops its own sender, which closes the
//! queue and lets the delivery loop drain and finish.

use crate::audio::AudioFrame;
use crate::config::RecognitionConfig;
use crate::session::protocol::TranscriptionSegment;
use crate::session::queue::{EventSender, SessionEvent};
use crate::transcription::{EngineFactory, PartialCallback, RecognitionEngine};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// The partial callback's route into the queue; emptied when the worker thread exits.
#[derive(Clone, Default)]
struct PartialRoute(Arc<Mutex<Option<EventSender>>>);

impl PartialRoute {
    fn connect(&self, events: EventSender) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Some(events);
    }

    fn disconnect(&self) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    fn push(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if let Some(events) = self.0.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            events.push_segment(TranscriptionSegment::partial(text));
        }
    }
}

pub struct RecognitionWorker {
    uid: String,
    engine: Arc<dyn RecognitionEngine>,
    events: Option<EventSender>,
    partials: PartialRoute,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    exited: Option<oneshot::Receiver<()>>,
}

impl RecognitionWorker {
    /// Build the engine for one session.
    ///
    /// Blocking; the session manager calls it through `spawn_blocking`.
    pub fn new(
        uid: &str,
        factory: &dyn EngineFactory,
        config: &RecognitionConfig,
        events: EventSender,
    ) -> Result<Self> {
        let partials = PartialRoute::default();
        partials.connect(events.clone());

        let route = partials.clone();
        let on_partial: PartialCallback = Arc::new(move |text: &str| route.push(text));
        let engine = factory.create(config, on_partial)?;
        debug!("[{}] {} engine ready", uid, factory.name());

        Ok(Self {
            uid: uid.to_string(),
            engine,
            events: Some(events),
            partials,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: None,
            exited: None,
        })
    }

    /// Spawn the worker thread. Calling it twice is an error.
    pub fn start(&mut self) -> Result<()> {
        let events = self
            .events
            .take()
            .ok_or_else(|| anyhow!("worker for {} already started", self.uid))?;
        let (exit_tx, exit_rx) = oneshot::channel();

        let engine = Arc::clone(&self.engine);
        let partials = self.partials.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let uid = self.uid.clone();

        let thread = std::thread::Builder::new()
            .name(format!("stt-worker-{}", self.uid))
            .spawn(move || {
                // Dropped on return or unwind; `join` waits on it.
                let _exit = exit_tx;
                run(&uid, engine.as_ref(), &events, &shutdown);
                partials.disconnect();
                debug!("[{}] worker thread exiting", uid);
            })
            .map_err(|e| anyhow!("Failed to spawn worker thread: {}", e))?;

        self.thread = Some(thread);
        self.exited = Some(exit_rx);
        Ok(())
    }

    /// Adapt a float frame and hand it to the engine.
    pub fn feed(&self, frame: AudioFrame) -> Result<()> {
        let pcm = frame.into_int16()?;
        self.engine.feed(pcm.as_bytes())
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.engine.shutdown();
        }
    }

    /// Wait for the worker thread to exit.
    ///
    /// ## Returns:
    /// - **true**: the thread exited (or was never started)
    /// - **false**: the timeout elapsed and the thread was detached
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(exited) = self.exited.take() else {
            return true;
        };

        match tokio::time::timeout(timeout, exited).await {
            Ok(_) => {
                // The exit signal fires as the thread returns, so this join is immediate.
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        error!("[{}] worker thread panicked", self.uid);
                    }
                }
                true
            }
            Err(_) => {
                warn!(
                    "[{}] worker did not exit within {:?}; detaching it",
                    self.uid, timeout
                );
                self.thread.take();
                false
            }
        }
    }
}

impl Drop for RecognitionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Body of the worker thread.
fn run(uid: &str, engine: &dyn RecognitionEngine, events: &EventSender, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        match engine.next_final() {
            Ok(Some(text)) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if text.trim().is_empty() {
                    debug!("[{}] empty final dropped", uid);
                    continue;
                }
                info!("[{}] final: {}", uid, text);
                events.push_segment(TranscriptionSegment::final_text(text));
            }
            Ok(None) => {
                debug!("[{}] engine drained", uid);
                break;
            }
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    events.push(SessionEvent::Failure(format!("{:#}", e)));
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::adapt;
    use crate::session::protocol::SegmentKind;
    use crate::session::queue;
    use crate::transcription::testing::{Script, ScriptedFactory};
    use byteorder::{ByteOrder, LittleEndian};

    fn float_frame(samples: &[f32]) -> AudioFrame {
        let mut bytes = vec![0u8; samples.len() * 4];
        LittleEndian::write_f32_into(samples, &mut bytes);
        AudioFrame::float32(bytes)
    }

    async fn collect(rx: &mut queue::EventReceiver) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.pop().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_partials_then_final_on_stop() {
        let factory = ScriptedFactory::new(Script::default());
        let (tx, mut rx) = queue::channel();
        let mut worker =
            RecognitionWorker::new("t", &factory, &RecognitionConfig::default(), tx).unwrap();
        worker.start().unwrap();

        worker.feed(float_frame(&[0.5, -0.5])).unwrap();
        worker.feed(float_frame(&[0.25])).unwrap();
        worker.stop();

        let events = collect(&mut rx).await;
        let segments: Vec<(SegmentKind, String)> = events
            .into_iter()
            .map(|e| match e {
                SessionEvent::Segment(s) => (s.kind(), s.text().to_string()),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            segments,
            vec![
                (SegmentKind::Partial, "w1".to_string()),
                (SegmentKind::Partial, "w1 w2".to_string()),
                (SegmentKind::Final, "w1 w2".to_string()),
            ]
        );
        assert!(worker.join(Duration::from_secs(1)).await);

        // The engine saw the adapted 16-bit frames.
        let fed = factory.engines()[0].fed();
        assert_eq!(fed[0], adapt(&[0.5, -0.5]));
    }

    #[tokio::test]
    async fn test_inference_failure_is_queued() {
        let factory = ScriptedFactory::new(Script {
            fail_inference: true,
            ..Script::default()
        });
        let (tx, mut rx) = queue::channel();
        let mut worker =
            RecognitionWorker::new("t", &factory, &RecognitionConfig::default(), tx).unwrap();
        worker.start().unwrap();
        worker.feed(float_frame(&[0.1])).unwrap();
        worker.stop();

        let events = collect(&mut rx).await;
        assert!(matches!(events.last(), Some(SessionEvent::Failure(m)) if m.contains("scripted")));
    }

    #[tokio::test]
    async fn test_shutdown_and_join() {
        let factory = ScriptedFactory::new(Script::default());
        let (tx, _rx) = queue::channel();
        let mut worker =
            RecognitionWorker::new("t", &factory, &RecognitionConfig::default(), tx).unwrap();
        worker.start().unwrap();
        assert!(worker.start().is_err());

        worker.shutdown();
        worker.shutdown();
        assert!(worker.join(Duration::from_secs(1)).await);
        assert!(worker.join(Duration::from_secs(1)).await);
        assert_eq!(factory.engines()[0].shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn test_join_timeout_detaches() {
        let factory = ScriptedFactory::new(Script {
            hang: Some(Duration::from_millis(500)),
            ..Script::default()
        });
        let (tx, _rx) = queue::channel();
        let mut worker =
            RecognitionWorker::new("t", &factory, &RecognitionConfig::default(), tx).unwrap();
        worker.start().unwrap();
        worker.feed(float_frame(&[0.1])).unwrap();
        // Give the thread time to enter the hanging call.
        tokio::time::sleep(Duration::from_millis(50)).await;

        worker.shutdown();
        assert!(!worker.join(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_text_is_forwarded_verbatim() {
        let factory = ScriptedFactory::new(Script {
            finalize_every: Some(1),
            padding: " ".to_string(),
            ..Script::default()
        });
        let (tx, mut rx) = queue::channel();
        let mut worker =
            RecognitionWorker::new("t", &factory, &RecognitionConfig::default(), tx).unwrap();
        worker.start().unwrap();

        worker.feed(float_frame(&[0.5])).unwrap();
        // Nothing is open any more, so stop yields a whitespace-only final.
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop();

        let texts: Vec<(SegmentKind, String)> = collect(&mut rx)
            .await
            .into_iter()
            .map(|e| match e {
                SessionEvent::Segment(s) => (s.kind(), s.text().to_string()),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                (SegmentKind::Partial, " w1 ".to_string()),
                (SegmentKind::Final, " w1 ".to_string()),
            ]
        );
    }

    #[test]
    fn test_construction_failure() {
        let factory = ScriptedFactory::failing();
        let (tx, _rx) = queue::channel();
        let result = RecognitionWorker::new("t", &factory, &RecognitionConfig::default(), tx);
        assert!(result.is_err());
    }
}
