//! # WebSocket Streaming Server
//!
//! Accepts streaming clients on the `stream` listener and runs one session per connection.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: any path; the session id is the peer address (`ip:port`)
//! 2. **Audio Streaming**: binary frames of f32 little-endian PCM, 16 kHz mono
//! 3. **Control**: `{"EOS": true}` finalizes the current utterance and ends the session
//! 4. **Transcription Results**: JSON text frames, partial (`inprogress`) and final
//!    (`transcribed`) segments
//!
//! Every connection runs in its own task; a failing session never affects the listener.

use crate::error::AppError;
use crate::session::{run_session, SessionContext};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

pub struct StreamServer {
    listener: TcpListener,
    ctx: SessionContext,
    ws_config: WebSocketConfig,
}

impl StreamServer {
    /// Bind the streaming listener. Failing to bind is fatal to the process.
    pub async fn bind(addr: &str, ctx: SessionContext) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind streaming listener on {}", addr))?;

        let ws_config = frame_limits(ctx.state.get_config().stream.max_frame_bytes);

        Ok(Self {
            listener,
            ctx,
            ws_config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves, then drop every live session.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Streaming endpoint listening on ws://{}", self.display_addr());
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(handle_connection(stream, peer, self.ctx.clone(), self.ws_config));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        if !sessions.is_empty() {
            info!("Dropping {} live session(s)", sessions.len());
        }
        sessions.shutdown().await;
    }

    fn display_addr(&self) -> String {
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}

/// Message and frame caps for accepted sockets; 0 lifts tungstenite's defaults entirely.
fn frame_limits(max_frame_bytes: usize) -> WebSocketConfig {
    let limit = (max_frame_bytes > 0).then_some(max_frame_bytes);
    let mut config = WebSocketConfig::default();
    config.max_message_size = limit;
    config.max_frame_size = limit;
    config
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
    ws_config: WebSocketConfig,
) {
    let id = peer.to_string();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[{}] could not set TCP_NODELAY: {}", id, e);
    }

    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[{}] WebSocket handshake failed: {}", id, AppError::from(e));
            return;
        }
    };
    debug!("[{}] WebSocket handshake complete", id);

    match run_session(ws, id.clone(), ctx).await {
        Ok(_) => {}
        Err(AppError::SessionLimit(_)) => {}
        Err(e) => error!("[{}] session failed: {}", id, e),
    }
}
