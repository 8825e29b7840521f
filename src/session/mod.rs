//! # Session Bridge
//!
//! Connects a blocking, callback-driven recognition engine to an asynchronous WebSocket.
//!
//! ## Per-session components:
//! - **Recognition Worker** (`worker`): the engine plus a dedicated thread blocked on it
//! - **Event Queue** (`queue`): the only channel between that thread and the async side
//! - **Delivery Loop** (`delivery`): a task writing queued events to the socket, in order
//! - **Session Manager** (`manager`): receive loop, control messages, teardown
//!
//! Nothing is shared between sessions apart from the ops registry in `AppState`.

pub mod delivery;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod worker;

pub use manager::{run_session, Session, SessionContext, SessionEnd, SessionState, SessionSummary};
pub use protocol::{ControlSignal, OutboundMessage, SegmentKind, TranscriptionSegment};
pub use queue::{EventReceiver, EventSender, SessionEvent};
pub use worker::RecognitionWorker;
