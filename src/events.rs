//! # Session Event Bus
//!
//! Decouples the realtime AI session manager from the telephony channel
//! manager. The AI side publishes per-call events; any number of subscribers
//! receive them through their own mailbox, so neither side owns the other's
//! state.
//!
//! ## Delivery model:
//! Unbounded mpsc mailbox per subscriber. Publishing never blocks the
//! session task; a subscriber that has gone away is pruned on the next
//! publish.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Event published by a realtime AI session, keyed by call id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// AI audio ready for playback, already transcoded to mu-law @ 8 kHz.
    AudioChunk {
        #[serde(skip_serializing)]
        audio: Vec<u8>,
    },

    /// The remote session acknowledged configuration and accepts audio.
    #[serde(rename = "openai_session_ready")]
    SessionReady,

    /// The remote service or socket reported an error.
    #[serde(rename = "openai_error")]
    SessionError { message: String },

    /// The session closed and will not reconnect.
    #[serde(rename = "openai_closed")]
    SessionClosed,

    /// The session re-established its socket after a drop.
    #[serde(rename = "openai_reconnected")]
    Reconnected { attempt: u32 },

    /// The reconnect budget is exhausted; the call is abandoned.
    #[serde(rename = "openai_max_reconnect_failed")]
    MaxReconnectFailed,

    /// Server VAD detected the caller starting to speak.
    SpeechStarted,

    /// Server VAD detected the caller stopping.
    SpeechStopped,

    /// A completed utterance (caller or assistant).
    TextMessage { role: String, content: String },

    /// The model requested a tool invocation.
    FunctionCall { name: String, arguments: String },
}

/// An event paired with the call it belongs to.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub call_id: String,
    pub event: SessionEvent,
}

/// Fan-out bus: one mailbox per subscriber.
#[derive(Clone, Default)]
pub struct NotificationBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<CallEvent>>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its mailbox.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Publish an event to every live subscriber. Closed mailboxes are
    /// removed as a side effect.
    pub fn publish(&self, call_id: &str, event: SessionEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| {
            tx.send(CallEvent {
                call_id: call_id.to_string(),
                event: event.clone(),
            })
            .is_ok()
        });
    }

    /// Number of live subscribers (for the metrics endpoint).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = NotificationBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("call-1", SessionEvent::SpeechStarted);

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.call_id, "call-1");
        assert_eq!(got_b.call_id, "call-1");
        assert!(matches!(got_a.event, SessionEvent::SpeechStarted));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = NotificationBus::new();
        let rx = bus.subscribe();
        let mut live = bus.subscribe();
        drop(rx);

        bus.publish("call-2", SessionEvent::SessionClosed);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(live.recv().await.is_some());
    }

    #[test]
    fn test_event_wire_names() {
        let json = serde_json::to_string(&SessionEvent::SessionReady).unwrap();
        assert!(json.contains("openai_session_ready"));
        let json = serde_json::to_string(&SessionEvent::MaxReconnectFailed).unwrap();
        assert!(json.contains("openai_max_reconnect_failed"));
        let json = serde_json::to_string(&SessionEvent::SpeechStopped).unwrap();
        assert!(json.contains("speech_stopped"));
    }
}
