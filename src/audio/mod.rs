//! # Audio Pipeline Module
//!
//! Audio handling for the telephony ⇄ speech-service bridge. Two fixed
//! formats exist in this system and nothing else is negotiated:
//!
//! - **Telephony side**: G.711 mu-law, 8-bit companded, 8 kHz, mono
//! - **Speech-service side**: PCM16 little-endian, 24 kHz, mono, base64-framed
//!
//! ## Key Components:
//! - **Transcode**: stateless conversions between the two formats, used on
//!   every frame in both directions
//! - **Queue**: per-call bounded buffer for frames captured before the remote
//!   session handshake completes, plus the commit batch tracker
//!
//! Frame-level failures (empty input, malformed base64) are dropped and
//! logged at this boundary; they never escalate to a call-level failure.

pub mod queue;        // Bounded pending-frame queue + commit tracking
pub mod transcode;    // mu-law ⇄ PCM16, 8 kHz ⇄ 24 kHz, base64 framing
