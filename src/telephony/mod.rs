//! # Telephony Integration
//!
//! The Asterisk side of the bridge:
//!
//! - `ari` — thin REST + event-WebSocket client for the Asterisk REST
//!   Interface (channels, bridges, recordings, playbacks)
//! - `calls` — per-call channel bookkeeping: answer, bridge, record, link
//!   to the realtime AI session, play AI audio back, tear everything down

pub mod ari;
pub mod calls;

pub use ari::AriClient;
pub use calls::CallSessionManager;
