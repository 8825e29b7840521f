//! # Speech Relay
//!
//! Streams microphone audio from WebSocket clients into a blocking speech recognition
//! engine and streams partial and final transcripts back.
//!
//! ## Application Architecture:
//! - **websocket**: the streaming listener, one task per connection
//! - **session**: per-connection bridge (worker thread, event queue, delivery loop)
//! - **audio**: client frame decoding and format adaptation
//! - **transcription**: the recognition engine seam and the bundled Whisper engine
//! - **config / device**: layered configuration and compute target selection
//! - **state / health / handlers / middleware**: the ops HTTP API
//! - **error**: error types shared by both surfaces

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod session;
pub mod state;
pub mod transcription;
pub mod websocket;
