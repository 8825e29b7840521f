//! # Session Manager
//!
//! Wires one WebSocket connection to its recognition worker, event queue and delivery
//! loop, runs the receive loop, and tears everything down exactly once.
//!
//! ## Session Lifecycle:
//! 1. **Open**: register with the session limit, build the engine on a blocking thread,
//!    start the worker thread and spawn the delivery task
//! 2. **Receive**: binary frames are adapted and fed; `{"EOS": true}` stops the worker;
//!    anything else textual is logged and ignored
//! 3. **Exit**: client close, transport error, connection deadline, or the delivery loop
//!    finishing (end of stream drained, or a recognition failure reported)
//! 4. **Teardown**: `Active → Stopping`, cancel delivery, shut the worker down, join it with
//!    a bounded timeout, `Stopping → Closed`
//!
//! ## Error Handling:
//! Transport problems end the session normally. Engine failures are reported to the
//! client when possible and returned to the caller as `AppError::Engine`. Nothing here
//! can affect another session.

use crate::audio::AudioFrame;
use crate::error::{AppError, AppResult};
use crate::session::delivery::{self, DeliveryEnd, DeliveryStats};
use crate::session::protocol::{parse_control, ControlSignal, ErrorMessage};
use crate::session::queue;
use crate::session::worker::RecognitionWorker;
use crate::state::AppState;
use crate::transcription::EngineFactory;
use anyhow::anyhow;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;
type Delivered<S> = (WsSink<S>, DeliveryEnd);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Stopping,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    ClientClosed,
    EndOfStream,
    TransportError,
    Deadline,
    EngineFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub end: SessionEnd,
    pub partials: u64,
    pub finals: u64,
    /// False when the worker thread was detached after the join timeout
    pub worker_joined: bool,
    pub duration_secs: f64,
    pub failure: Option<String>,
}

/// What every session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub state: AppState,
    pub factory: Arc<dyn EngineFactory>,
}

enum Step<S> {
    Frame(Option<Result<Message, tungstenite::Error>>),
    Delivered(Result<Delivered<S>, JoinError>),
    Deadline,
}

/// One client connection and everything it owns.
pub struct Session<S> {
    id: String,
    state: SessionState,
    app: AppState,
    worker: Option<RecognitionWorker>,
    delivery: Option<JoinHandle<Delivered<S>>>,
    stats: Arc<DeliveryStats>,
    join_timeout: Duration,
    worker_joined: bool,
    end_of_stream: bool,
    failure: Option<String>,
    started: Instant,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Register the session and start its worker and delivery loop.
    ///
    /// On failure the client gets a best-effort error message and a close frame.
    pub async fn open(id: String, mut sink: WsSink<S>, ctx: &SessionContext) -> AppResult<Self> {
        let started = Instant::now();
        let config = ctx.state.get_config();
        let stats = Arc::new(DeliveryStats::default());

        if let Err(e) = ctx.state.open_session(
            &id,
            Arc::clone(&stats),
            config.performance.max_concurrent_sessions,
        ) {
            warn!("[{}] refused: {}", id, e);
            refuse(&mut sink, &id, &e.to_string()).await;
            return Err(e);
        }
        info!("[{}] session opened", id);

        let (events, queue) = queue::channel();
        let factory = Arc::clone(&ctx.factory);
        let recognition = config.recognition.clone();
        let uid = id.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let mut worker = RecognitionWorker::new(&uid, factory.as_ref(), &recognition, events)?;
            worker.start()?;
            Ok::<_, anyhow::Error>(worker)
        })
        .await
        .map_err(|e| anyhow!("engine construction panicked: {}", e))
        .and_then(|result| result);

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                let message = format!("{:#}", e);
                error!("[{}] failed to start recognition: {}", id, message);
                refuse(&mut sink, &id, &message).await;
                ctx.state.close_session(&SessionSummary {
                    id: id.clone(),
                    end: SessionEnd::EngineFailure,
                    partials: 0,
                    finals: 0,
                    worker_joined: true,
                    duration_secs: started.elapsed().as_secs_f64(),
                    failure: Some(message.clone()),
                });
                return Err(AppError::Engine(message));
            }
        };

        let delivery = tokio::spawn(delivery::run(queue, sink, id.clone(), Arc::clone(&stats)));

        Ok(Self {
            id,
            state: SessionState::Active,
            app: ctx.state.clone(),
            worker: Some(worker),
            delivery: Some(delivery),
            stats,
            join_timeout: config.stream.join_timeout(),
            worker_joined: true,
            end_of_stream: false,
            failure: None,
            started,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("[{}] {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.app.set_session_state(&self.id, state);
    }

    /// Run the receive loop until the session should end.
    pub async fn receive(&mut self, stream: &mut WsSource<S>, limit: Option<Duration>) -> SessionEnd {
        let deadline = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                frame = stream.next() => Step::Frame(frame),
                delivered = self.delivery_finished() => Step::Delivered(delivered),
                _ = &mut deadline => Step::Deadline,
            };

            match step {
                Step::Frame(Some(Ok(Message::Binary(bytes)))) => self.on_audio(bytes),
                Step::Frame(Some(Ok(Message::Text(text)))) => self.on_control(&text),
                Step::Frame(Some(Ok(Message::Close(_)))) | Step::Frame(None) => {
                    debug!("[{}] client closed the connection", self.id);
                    return SessionEnd::ClientClosed;
                }
                Step::Frame(Some(Ok(_))) => {}
                Step::Frame(Some(Err(e))) => {
                    debug!("[{}] transport error: {}", self.id, e);
                    return SessionEnd::TransportError;
                }
                Step::Delivered(result) => {
                    self.delivery = None;
                    return self.finish_delivery(result).await;
                }
                Step::Deadline => {
                    info!("[{}] maximum connection time reached", self.id);
                    return SessionEnd::Deadline;
                }
            }
        }
    }

    fn on_audio(&self, bytes: Vec<u8>) {
        if self.end_of_stream {
            trace!("[{}] ignoring {} bytes after end of stream", self.id, bytes.len());
            return;
        }
        if let Some(worker) = &self.worker {
            if let Err(e) = worker.feed(AudioFrame::float32(bytes)) {
                warn!("[{}] dropping audio frame: {:#}", self.id, e);
            }
        }
    }

    fn on_control(&mut self, text: &str) {
        match parse_control(text) {
            Ok(Some(ControlSignal::EndOfStream)) => {
                if self.end_of_stream {
                    return;
                }
                info!("[{}] end of stream", self.id);
                self.end_of_stream = true;
                if let Some(worker) = &self.worker {
                    worker.stop();
                }
            }
            Ok(None) => debug!("[{}] ignoring control message: {}", self.id, text),
            Err(e) => warn!("[{}] ignoring malformed control message: {}", self.id, e),
        }
    }

    async fn delivery_finished(&mut self) -> Result<Delivered<S>, JoinError> {
        match self.delivery.as_mut() {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    }

    async fn finish_delivery(&mut self, result: Result<Delivered<S>, JoinError>) -> SessionEnd {
        let (mut sink, end) = match result {
            Ok(delivered) => delivered,
            Err(e) => {
                error!("[{}] delivery task failed: {}", self.id, e);
                return SessionEnd::TransportError;
            }
        };

        let session_end = match end {
            DeliveryEnd::Drained => SessionEnd::EndOfStream,
            DeliveryEnd::TransportClosed => return SessionEnd::TransportError,
            DeliveryEnd::Failure(message) => {
                self.failure = Some(message);
                SessionEnd::EngineFailure
            }
        };

        if let Err(e) = sink.close().await {
            debug!("[{}] close frame not delivered: {}", self.id, e);
        }
        session_end
    }

    /// Release the worker, queue and delivery loop.
    ///
    /// Runs once; later calls return false without touching anything.
    pub async fn teardown(&mut self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        self.set_state(SessionState::Stopping);

        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
            match delivery.await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("[{}] delivery task failed: {}", self.id, e),
            }
        }

        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
            self.worker_joined = worker.join(self.join_timeout).await;
        }

        self.set_state(SessionState::Closed);
        true
    }

    pub fn summary(&self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            end,
            partials: self.stats.partials(),
            finals: self.stats.finals(),
            worker_joined: self.worker_joined,
            duration_secs: self.started.elapsed().as_secs_f64(),
            failure: self.failure.clone(),
        }
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        // Dropped without teardown (e.g. the server is shutting down): cancel what we can.
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

/// Drive one accepted WebSocket connection from open to close.
///
/// ## Returns:
/// - **Ok(summary)**: the session ended normally (any close path)
/// - **Err(AppError::SessionLimit)**: refused, the relay is full
/// - **Err(AppError::Engine)**: recognition failed to start or failed mid-session
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    id: String,
    ctx: SessionContext,
) -> AppResult<SessionSummary>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let limit = ctx.state.get_config().stream.max_connection_time();
    let (sink, mut stream) = ws.split();

    let mut session = Session::open(id, sink, &ctx).await?;
    let end = session.receive(&mut stream, limit).await;
    session.teardown().await;

    let summary = session.summary(end);
    ctx.state.close_session(&summary);
    info!(
        "[{}] session closed ({:?}): {} partial / {} final segments in {:.1}s{}",
        summary.id,
        summary.end,
        summary.partials,
        summary.finals,
        summary.duration_secs,
        if summary.worker_joined { "" } else { ", worker detached" }
    );

    match (&summary.end, &summary.failure) {
        (SessionEnd::EngineFailure, Some(message)) => Err(AppError::Engine(message.clone())),
        _ => Ok(summary),
    }
}

/// Best-effort error notice followed by a close frame.
async fn refuse<K>(sink: &mut K, uid: &str, message: &str)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    if let Ok(json) = ErrorMessage::new(uid, message).to_json() {
        if let Err(e) = sink.send(Message::Text(json)).await {
            debug!("[{}] could not send error message: {}", uid, e);
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("[{}] could not close connection: {}", uid, e);
    }
}
