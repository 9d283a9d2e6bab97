//! # Realtime Speech Service Integration
//!
//! Everything that talks to the realtime speech API lives here:
//!
//! - `messages` — serde models for the JSON wire protocol
//! - `session` — the per-call task that owns the WebSocket and runs the
//!   handshake, audio commit scheduling and reconnection state machine
//! - `manager` — the registry of live call sessions and their command
//!   channels
//! - `reconnect` — backoff policy for abnormal socket loss
//! - `timers` — cancelable one-shot timers used by the session task

pub mod manager;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod timers;

pub use manager::RealtimeSessionManager;
pub use session::{SessionCommand, SessionSettings, SessionStatus};
